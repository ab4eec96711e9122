//! OGC Filter Encoding for `GetFeature` requests

use federa_query::{Bounds, ClauseValue, DataError, Operator, QueryClause, Result};
use quick_xml::escape::escape;

use crate::config::WfsVersion;

const WILDCARD: &str = "%";
const SINGLE_CHAR: &str = "_";
const ESCAPE_CHAR: &str = "\\";

fn comparison_tag(operator: Operator) -> &'static str {
    match operator {
        Operator::Eq => "PropertyIsEqualTo",
        Operator::Ne => "PropertyIsNotEqualTo",
        Operator::Lt => "PropertyIsLessThan",
        Operator::Le => "PropertyIsLessThanOrEqualTo",
        Operator::Gt => "PropertyIsGreaterThan",
        Operator::Ge => "PropertyIsGreaterThanOrEqualTo",
        Operator::Like | Operator::ILike => "PropertyIsLike",
    }
}

fn gml_namespace(version: WfsVersion) -> &'static str {
    match version {
        WfsVersion::V2_0_0 => "http://www.opengis.net/gml/3.2",
        _ => "http://www.opengis.net/gml",
    }
}

fn element(version: WfsVersion, tag: &str, attributes: &str, content: &str) -> String {
    let prefix = version.filter_prefix();
    format!("<{p}:{t}{a}>{c}</{p}:{t}>", p = prefix, t = tag, a = attributes, c = content)
}

fn property(version: WfsVersion, name: &str) -> String {
    let tag = version.property_element();
    format!("<{t}>{n}</{t}>", t = tag, n = escape(name))
}

fn literal(version: WfsVersion, text: &str) -> String {
    element(version, "Literal", "", &escape(text))
}

fn like(version: WfsVersion, field: &str, pattern: &str, match_case: bool) -> String {
    let escape_attr = match version {
        WfsVersion::V1_0_0 => "escape",
        _ => "escapeChar",
    };
    let mut attributes = format!(
        " wildCard=\"{}\" singleChar=\"{}\" {}=\"{}\"",
        WILDCARD, SINGLE_CHAR, escape_attr, ESCAPE_CHAR
    );
    if !match_case {
        attributes.push_str(" matchCase=\"false\"");
    }
    element(
        version,
        "PropertyIsLike",
        &attributes,
        &format!("{}{}", property(version, field), literal(version, pattern)),
    )
}

fn value_text(clause: &QueryClause) -> Result<String> {
    match &clause.value {
        ClauseValue::Boolean(b) => Ok(b.to_string()),
        ClauseValue::Number(n) => Ok(n.to_string()),
        ClauseValue::String(s) => Ok(s.clone()),
        ClauseValue::Null => Ok(String::new()),
        ClauseValue::Variable(name) => Err(DataError::InvalidQuery(format!(
            "Unresolved variable {{{}}} in clause on {}",
            name, clause.field_name
        ))),
    }
}

/// Filter predicate for one clause
pub fn clause_xml(version: WfsVersion, clause: &QueryClause) -> Result<String> {
    let field = clause.field_name.as_str();

    if clause.value.is_null() {
        let is_null = element(version, "PropertyIsNull", "", &property(version, field));
        return match clause.operator {
            Operator::Eq => Ok(is_null),
            Operator::Ne => Ok(element(version, "Not", "", &is_null)),
            other => Err(DataError::InvalidQuery(format!(
                "Operator {} cannot compare {} with null",
                other, field
            ))),
        };
    }

    let text = value_text(clause)?;
    Ok(match clause.operator {
        Operator::Like => like(version, field, &text, true),
        Operator::ILike => like(version, field, &text, false),
        operator => element(
            version,
            comparison_tag(operator),
            "",
            &format!("{}{}", property(version, field), literal(version, &text)),
        ),
    })
}

/// `<BBOX>` predicate on a geometry property
pub fn bbox_xml(version: WfsVersion, geometry_field: &str, bounds: &Bounds, srs: &str) -> String {
    let envelope = format!(
        "<gml:Envelope srsName=\"{}\"><gml:lowerCorner>{} {}</gml:lowerCorner><gml:upperCorner>{} {}</gml:upperCorner></gml:Envelope>",
        escape(srs),
        bounds.min_x,
        bounds.min_y,
        bounds.max_x,
        bounds.max_y
    );
    element(
        version,
        "BBOX",
        "",
        &format!("{}{}", property(version, geometry_field), envelope),
    )
}

/// Wrap predicates in a `<Filter>`, combining several with `combinator`
fn wrap(version: WfsVersion, mut predicates: Vec<String>, combinator: &str) -> Option<String> {
    let body = match predicates.len() {
        0 => return None,
        1 => predicates.remove(0),
        _ => element(version, combinator, "", &predicates.concat()),
    };
    Some(format!(
        "<{p}:Filter xmlns:{p}=\"{ns}\" xmlns:gml=\"{gml}\">{body}</{p}:Filter>",
        p = version.filter_prefix(),
        ns = version.filter_namespace(),
        gml = gml_namespace(version),
        body = body
    ))
}

/// `bbox` parameter value; the srs suffix exists from 1.1.0 upwards
pub fn bbox_param(version: WfsVersion, bounds: &Bounds, srs: &str) -> String {
    match version {
        WfsVersion::V1_0_0 => bounds.to_bbox_string(),
        _ => format!("{},{}", bounds.to_bbox_string(), srs),
    }
}

/// `filter` or `bbox` request parameters for clauses and optional bounds.
///
/// Bounds alone travel as a `bbox` parameter. The two parameters are mutually
/// exclusive, so bounds together with clauses become a `<BBOX>` predicate
/// inside the filter, which WFS 1.0.0 cannot express.
pub fn spatial_filter_params(
    version: WfsVersion,
    clauses: &[QueryClause],
    bounds: Option<&Bounds>,
    geometry_field: &str,
    srs: &str,
) -> Result<Vec<(String, String)>> {
    filter_params(version, clauses, Vec::new(), bounds, geometry_field, srs)
}

/// As [`spatial_filter_params`], with extra prebuilt predicates
pub fn filter_params(
    version: WfsVersion,
    clauses: &[QueryClause],
    extra: Vec<String>,
    bounds: Option<&Bounds>,
    geometry_field: &str,
    srs: &str,
) -> Result<Vec<(String, String)>> {
    let mut predicates = clauses
        .iter()
        .map(|clause| clause_xml(version, clause))
        .collect::<Result<Vec<_>>>()?;
    predicates.extend(extra);

    match bounds {
        Some(bounds) if predicates.is_empty() => {
            return Ok(vec![("bbox".to_string(), bbox_param(version, bounds, srs))]);
        }
        Some(_) if !version.supports_bbox_filter() => {
            return Err(DataError::not_supported(format!(
                "WFS {} cannot combine bounds with attribute filters",
                version
            )));
        }
        Some(bounds) => predicates.push(bbox_xml(version, geometry_field, bounds, srs)),
        None => {}
    }

    Ok(wrap(version, predicates, "And")
        .map(|filter| vec![("filter".to_string(), filter)])
        .unwrap_or_default())
}

/// Predicate matching any of `values` on `field`
pub fn equals_any(version: WfsVersion, field: &str, values: &[String]) -> Option<String> {
    let mut predicates: Vec<String> = values
        .iter()
        .map(|value| {
            element(
                version,
                "PropertyIsEqualTo",
                "",
                &format!("{}{}", property(version, field), literal(version, value)),
            )
        })
        .collect();
    match predicates.len() {
        0 => None,
        1 => predicates.pop(),
        _ => Some(element(version, "Or", "", &predicates.concat())),
    }
}

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '%' || c == '_' || c == '\\' {
            escaped.push_str(ESCAPE_CHAR);
        }
        escaped.push(c);
    }
    escaped
}

/// Case-insensitive "contains" match of `text` on any of `fields`
pub fn search_filter(version: WfsVersion, fields: &[String], text: &str) -> Option<String> {
    let pattern = format!("{w}{t}{w}", w = WILDCARD, t = escape_like(text));
    let predicates = fields
        .iter()
        .map(|field| like(version, field, &pattern, false))
        .collect();
    wrap(version, predicates, "Or")
}
