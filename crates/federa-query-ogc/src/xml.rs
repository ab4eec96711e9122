//! Reading of WFS and WMS XML responses

use federa_query::{DataError, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::config::WfsVersion;

const AUTH_MARKERS: &[&str] = &[
    "authenticat",
    "authoris",
    "authoriz",
    "not logged in",
    "credentials",
    "access denied",
];

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attribute(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == name.as_bytes())
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()))
}

fn xml_error(e: quick_xml::Error) -> DataError {
    DataError::protocol(format!("Malformed XML response: {}", e))
}

fn is_exception_root(name: &str) -> bool {
    name == "ExceptionReport" || name == "ServiceExceptionReport"
}

/// Text of an OWS exception report; `None` for any other document
pub fn exception_text(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut in_report = false;
    let mut text = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let name = local_name(e);
                if !in_report {
                    if !is_exception_root(&name) {
                        return None;
                    }
                    in_report = true;
                }
                if let Some(code) = attribute(e, "exceptionCode").or_else(|| attribute(e, "code")) {
                    text.push(code);
                }
            }
            Ok(Event::Text(ref e)) if in_report => {
                if let Ok(t) = e.unescape() {
                    if !t.trim().is_empty() {
                        text.push(t.trim().to_string());
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
    }
    in_report.then(|| text.join(": "))
}

/// Error for a response body that is an exception report
pub fn exception_error(xml: &str) -> Option<DataError> {
    let text = exception_text(xml)?;
    if mentions_authentication(&text) {
        Some(DataError::Unauthorized(text))
    } else {
        Some(DataError::protocol(format!("Service exception: {}", text)))
    }
}

fn mentions_authentication(text: &str) -> bool {
    let lower = text.to_lowercase();
    AUTH_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Whether a probe response shows the caller as authenticated.
///
/// Bodies that are not XML at all count as authenticated. Proxies in front
/// of some services answer successful requests with HTML or JSON, so the
/// heuristic depends on the service rather than the protocol.
pub fn probe_authenticated(status: u16, body: &str) -> bool {
    if status == 401 || status == 403 {
        return false;
    }

    let mut reader = Reader::from_str(body);
    let mut root: Option<String> = None;
    let mut text = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                if root.is_none() {
                    root = Some(local_name(e));
                }
            }
            Ok(Event::Text(ref e)) => {
                if let Ok(t) = e.unescape() {
                    text.push_str(&t);
                    text.push(' ');
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => return true,
            _ => {}
        }
    }

    match root {
        Some(name) if is_exception_root(&name) => !mentions_authentication(&text),
        // Plain text or JSON; no element at all
        None => true,
        Some(_) => true,
    }
}

/// Feature count of a `resultType=hits` response
pub fn parse_hits(version: WfsVersion, xml: &str) -> Result<u64> {
    if let Some(error) = exception_error(xml) {
        return Err(error);
    }

    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let value = attribute(e, version.hits_attribute())
                    .or_else(|| attribute(e, "numberOfFeatures"))
                    .or_else(|| attribute(e, "numberMatched"));
                return match value {
                    Some(v) => v.trim().parse::<u64>().map_err(|_| {
                        DataError::protocol(format!("Service cannot count features (hits: {})", v))
                    }),
                    None => Err(DataError::protocol(format!(
                        "Hits response without {} attribute",
                        version.hits_attribute()
                    ))),
                };
            }
            Event::Eof => return Err(DataError::protocol("Empty hits response")),
            _ => {}
        }
    }
}

/// Property of a feature type as declared by `DescribeFeatureType`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaProperty {
    pub name: String,
    /// Declared type with its namespace prefix, e.g. `xsd:string`
    pub type_name: String,
    pub nillable: bool,
    pub max_length: Option<u32>,
}

impl SchemaProperty {
    /// Type name without its namespace prefix
    pub fn local_type(&self) -> &str {
        self.type_name
            .rsplit(':')
            .next()
            .unwrap_or(&self.type_name)
    }
}

/// Properties of the complex types in a `DescribeFeatureType` XSD
pub fn parse_schema(xml: &str) -> Result<Vec<SchemaProperty>> {
    if let Some(error) = exception_error(xml) {
        return Err(error);
    }

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut complex_depth = 0usize;
    let mut properties = Vec::new();
    // Element with an inline simple type, completed at its end tag
    let mut open: Option<SchemaProperty> = None;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(ref e) => match local_name(e).as_str() {
                "complexType" => complex_depth += 1,
                "element" if complex_depth > 0 => {
                    if let Some(property) = schema_property(e) {
                        if property.type_name.is_empty() {
                            open = Some(property);
                        } else {
                            properties.push(property);
                        }
                    }
                }
                "restriction" => {
                    if let (Some(property), Some(base)) = (open.as_mut(), attribute(e, "base")) {
                        property.type_name = base;
                    }
                }
                _ => {}
            },
            Event::Empty(ref e) => match local_name(e).as_str() {
                "element" if complex_depth > 0 => properties.extend(schema_property(e)),
                "restriction" => {
                    if let (Some(property), Some(base)) = (open.as_mut(), attribute(e, "base")) {
                        property.type_name = base;
                    }
                }
                "maxLength" => {
                    if let Some(property) = open.as_mut() {
                        property.max_length = attribute(e, "value").and_then(|v| v.parse().ok());
                    }
                }
                _ => {}
            },
            Event::End(ref e) => match String::from_utf8_lossy(e.local_name().as_ref()).as_ref() {
                "complexType" => complex_depth = complex_depth.saturating_sub(1),
                "element" => {
                    if let Some(mut property) = open.take() {
                        if property.type_name.is_empty() {
                            property.type_name = "xsd:string".to_string();
                        }
                        properties.push(property);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if properties.is_empty() {
        return Err(DataError::protocol("Feature type schema declares no properties"));
    }
    Ok(properties)
}

fn schema_property(e: &BytesStart<'_>) -> Option<SchemaProperty> {
    let name = attribute(e, "name")?;
    Some(SchemaProperty {
        name,
        type_name: attribute(e, "type").unwrap_or_default(),
        nillable: attribute(e, "nillable").as_deref() == Some("true"),
        max_length: None,
    })
}

/// Feature type advertised by a WFS `GetCapabilities` response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureTypeSummary {
    pub name: String,
    pub title: Option<String>,
}

pub fn parse_capabilities(xml: &str) -> Result<Vec<FeatureTypeSummary>> {
    if let Some(error) = exception_error(xml) {
        return Err(error);
    }

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut types = Vec::new();
    let mut current: Option<FeatureTypeSummary> = None;
    let mut child: Option<String> = None;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(ref e) => {
                let name = local_name(e);
                if name == "FeatureType" {
                    current = Some(FeatureTypeSummary {
                        name: String::new(),
                        title: None,
                    });
                } else if current.is_some() {
                    child = Some(name);
                }
            }
            Event::Text(ref e) => {
                if let (Some(summary), Some(child)) = (current.as_mut(), child.as_deref()) {
                    let text = e.unescape().map_err(xml_error)?.into_owned();
                    match child {
                        "Name" if summary.name.is_empty() => summary.name = text,
                        "Title" if summary.title.is_none() => summary.title = Some(text),
                        _ => {}
                    }
                }
            }
            Event::End(ref e) => {
                if e.local_name().as_ref() == b"FeatureType" {
                    if let Some(summary) = current.take().filter(|s| !s.name.is_empty()) {
                        types.push(summary);
                    }
                }
                child = None;
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(types)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xsd:schema xmlns:gml="http://www.opengis.net/gml" xmlns:topp="http://www.openplans.org/topp" xmlns:xsd="http://www.w3.org/2001/XMLSchema" elementFormDefault="qualified" targetNamespace="http://www.openplans.org/topp">
  <xsd:import namespace="http://www.opengis.net/gml" schemaLocation="http://schemas.opengis.net/gml/3.1.1/base/gml.xsd"/>
  <xsd:complexType name="polesType">
    <xsd:complexContent>
      <xsd:extension base="gml:AbstractFeatureType">
        <xsd:sequence>
          <xsd:element maxOccurs="1" minOccurs="0" name="the_geom" nillable="true" type="gml:PointPropertyType"/>
          <xsd:element maxOccurs="1" minOccurs="0" name="pole_id" nillable="false" type="xsd:int"/>
          <xsd:element maxOccurs="1" minOccurs="0" name="name" nillable="true">
            <xsd:simpleType>
              <xsd:restriction base="xsd:string">
                <xsd:maxLength value="40"/>
              </xsd:restriction>
            </xsd:simpleType>
          </xsd:element>
          <xsd:element maxOccurs="1" minOccurs="0" name="installed" nillable="true" type="xsd:date"/>
        </xsd:sequence>
      </xsd:extension>
    </xsd:complexContent>
  </xsd:complexType>
  <xsd:element name="poles" substitutionGroup="gml:_Feature" type="topp:polesType"/>
</xsd:schema>"#;

    #[test]
    fn test_parse_schema() {
        let properties = parse_schema(SCHEMA).unwrap();
        let names: Vec<&str> = properties.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["the_geom", "pole_id", "name", "installed"]);

        assert_eq!(properties[0].local_type(), "PointPropertyType");
        assert!(properties[0].nillable);
        assert_eq!(properties[1].type_name, "xsd:int");
        assert!(!properties[1].nillable);
        assert_eq!(properties[2].type_name, "xsd:string");
        assert_eq!(properties[2].max_length, Some(40));
    }

    #[test]
    fn test_parse_hits() {
        let v11 = r#"<wfs:FeatureCollection xmlns:wfs="http://www.opengis.net/wfs" numberOfFeatures="42" timeStamp="2024-01-01T00:00:00Z"/>"#;
        assert_eq!(parse_hits(WfsVersion::V1_1_0, v11).unwrap(), 42);

        let v20 = r#"<?xml version="1.0"?><wfs:FeatureCollection xmlns:wfs="http://www.opengis.net/wfs/2.0" numberMatched="7" numberReturned="0"></wfs:FeatureCollection>"#;
        assert_eq!(parse_hits(WfsVersion::V2_0_0, v20).unwrap(), 7);

        let unknown = r#"<wfs:FeatureCollection numberMatched="unknown" numberReturned="0"/>"#;
        assert!(matches!(parse_hits(WfsVersion::V2_0_0, unknown), Err(DataError::Protocol(_))));
    }

    #[test]
    fn test_exception_reports() {
        let report = r#"<ows:ExceptionReport xmlns:ows="http://www.opengis.net/ows" version="1.1.0">
  <ows:Exception exceptionCode="InvalidParameterValue" locator="typeName">
    <ows:ExceptionText>Feature type topp:nope unknown</ows:ExceptionText>
  </ows:Exception>
</ows:ExceptionReport>"#;
        assert_eq!(
            exception_text(report).as_deref(),
            Some("InvalidParameterValue: Feature type topp:nope unknown")
        );
        assert!(matches!(parse_hits(WfsVersion::V1_1_0, report), Err(DataError::Protocol(_))));
        assert_eq!(exception_text("<wfs:FeatureCollection/>"), None);
    }

    #[test]
    fn test_probe_authenticated() {
        assert!(!probe_authenticated(401, ""));
        assert!(!probe_authenticated(403, "<html/>"));

        let denied = r#"<ServiceExceptionReport><ServiceException>Authentication required</ServiceException></ServiceExceptionReport>"#;
        assert!(!probe_authenticated(200, denied));

        let other = r#"<ServiceExceptionReport><ServiceException>Layer not defined</ServiceException></ServiceExceptionReport>"#;
        assert!(probe_authenticated(200, other));

        assert!(probe_authenticated(200, "<WMS_Capabilities version=\"1.3.0\"></WMS_Capabilities>"));
        // Not XML at all
        assert!(probe_authenticated(200, "<html><body><p>Welcome</body></html>"));
        assert!(probe_authenticated(200, "{\"type\":\"FeatureCollection\"}"));
    }

    #[test]
    fn test_parse_capabilities() {
        let xml = r#"<wfs:WFS_Capabilities xmlns:wfs="http://www.opengis.net/wfs" version="1.1.0">
  <FeatureTypeList>
    <FeatureType><Name>topp:poles</Name><Title>Poles</Title></FeatureType>
    <FeatureType><Name>topp:cables</Name></FeatureType>
  </FeatureTypeList>
</wfs:WFS_Capabilities>"#;
        let types = parse_capabilities(xml).unwrap();
        assert_eq!(
            types,
            vec![
                FeatureTypeSummary { name: "topp:poles".to_string(), title: Some("Poles".to_string()) },
                FeatureTypeSummary { name: "topp:cables".to_string(), title: None },
            ]
        );
    }
}
