//! WMS `GetMap` and `GetLegendGraphic` URLs

use federa_query::{Bounds, DataError, Result};
use url::Url;

/// Half the width of the web mercator world, in metres
const MERCATOR_EXTENT: f64 = 20_037_508.342_789_244;

pub const WEB_MERCATOR: &str = "EPSG:3857";
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Parameters of a `GetMap` request
#[derive(Debug, Clone, PartialEq)]
pub struct GetMapRequest {
    pub layers: Vec<String>,
    pub styles: Vec<String>,
    pub bounds: Bounds,
    pub width: u32,
    pub height: u32,
    pub crs: String,
    pub format: String,
    pub transparent: bool,
}

impl GetMapRequest {
    pub fn new(layers: Vec<String>, bounds: Bounds, width: u32, height: u32, crs: impl Into<String>) -> Self {
        Self {
            layers,
            styles: Vec::new(),
            bounds,
            width,
            height,
            crs: crs.into(),
            format: "image/png".to_string(),
            transparent: true,
        }
    }
}

/// Web mercator bounds of an XYZ tile (y counted from the top)
pub fn tile_bounds(x: u32, y: u32, z: u8) -> Bounds {
    let tiles = f64::from(1u32 << z.min(31));
    let size = 2.0 * MERCATOR_EXTENT / tiles;
    let min_x = -MERCATOR_EXTENT + f64::from(x) * size;
    let max_y = MERCATOR_EXTENT - f64::from(y) * size;
    Bounds::new(min_x, max_y - size, min_x + size, max_y)
}

/// URL builder for one WMS endpoint
#[derive(Debug, Clone)]
pub struct WmsService {
    url: String,
    version: String,
}

impl WmsService {
    pub fn new(url: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            version: version.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    fn is_1_3(&self) -> bool {
        self.version.starts_with("1.3")
    }

    fn build(&self, params: &[(&str, String)]) -> Result<String> {
        Url::parse_with_params(&self.url, params)
            .map(|url| url.to_string())
            .map_err(|e| DataError::invalid_configuration(format!("Invalid WMS URL {}: {}", self.url, e)))
    }

    /// `GetCapabilities` URL, used when probing authentication
    pub fn capabilities_url(&self) -> Result<String> {
        self.build(&[
            ("service", "WMS".to_string()),
            ("version", self.version.clone()),
            ("request", "GetCapabilities".to_string()),
        ])
    }

    pub fn get_map_url(&self, request: &GetMapRequest) -> Result<String> {
        if request.layers.is_empty() {
            return Err(DataError::bad_request("GetMap needs at least one layer"));
        }

        let b = &request.bounds;
        // WMS 1.3.0 uses the axis order of the CRS; EPSG:4326 is lat/lon
        let bbox = if self.is_1_3() && request.crs.eq_ignore_ascii_case("EPSG:4326") {
            format!("{},{},{},{}", b.min_y, b.min_x, b.max_y, b.max_x)
        } else {
            b.to_bbox_string()
        };
        let crs_param = if self.is_1_3() { "crs" } else { "srs" };

        self.build(&[
            ("service", "WMS".to_string()),
            ("version", self.version.clone()),
            ("request", "GetMap".to_string()),
            ("layers", request.layers.join(",")),
            ("styles", request.styles.join(",")),
            (crs_param, request.crs.clone()),
            ("bbox", bbox),
            ("width", request.width.to_string()),
            ("height", request.height.to_string()),
            ("format", request.format.clone()),
            ("transparent", request.transparent.to_string().to_uppercase()),
        ])
    }

    /// `GetMap` URL of an XYZ web mercator tile
    pub fn tile_url(&self, layers: &[String], x: u32, y: u32, z: u8) -> Result<String> {
        self.get_map_url(&GetMapRequest::new(
            layers.to_vec(),
            tile_bounds(x, y, z),
            DEFAULT_TILE_SIZE,
            DEFAULT_TILE_SIZE,
            WEB_MERCATOR,
        ))
    }

    pub fn legend_url(&self, layer: &str, style: Option<&str>) -> Result<String> {
        let mut params = vec![
            ("service", "WMS".to_string()),
            ("version", self.version.clone()),
            ("request", "GetLegendGraphic".to_string()),
            ("layer", layer.to_string()),
            ("format", "image/png".to_string()),
        ];
        if let Some(style) = style {
            params.push(("style", style.to_string()));
        }
        self.build(&params)
    }
}
