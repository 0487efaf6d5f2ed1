use crate::db::core::NetRole;
use crate::db::indices::NetId;
use crate::geom::polygon::PolygonDefect;
use thiserror::Error;

/// Malformed input geometry. Fatal for the batch under the reject policy.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeometryError {
    #[error("{entity}: polygon is degenerate ({defect:?})")]
    Degenerate {
        entity: String,
        defect: PolygonDefect,
    },

    #[error("{entity}: polygon edges {a} and {b} intersect")]
    SelfIntersecting { entity: String, a: usize, b: usize },

    #[error("grid resolution must be positive, got {0}")]
    NonPositiveResolution(f64),

    #[error("routing extent is empty")]
    EmptyExtent,

    #[error("grid of {cells} cells exceeds the configured limit of {limit}")]
    GridTooLarge { cells: usize, limit: usize },

    #[error("{entity}: layer {layer} outside the {layers}-layer stack")]
    LayerOutOfRange {
        entity: String,
        layer: u8,
        layers: u8,
    },

    #[error("net {net}: {role} terminal lies outside the routing extent")]
    TerminalOutOfBounds { net: NetId, role: NetRole },

    #[error("net {net}: {role} terminal is not in a free cell")]
    TerminalBlocked { net: NetId, role: NetRole },

    #[error("net {net}: terminal discipline differs from the net discipline")]
    DisciplineMismatch { net: NetId },

    #[error("net id {0} appears more than once")]
    DuplicateNet(NetId),
}

impl GeometryError {
    pub fn from_defect(entity: impl Into<String>, defect: PolygonDefect) -> Self {
        let entity = entity.into();
        match defect {
            PolygonDefect::SelfIntersecting { a, b } => {
                GeometryError::SelfIntersecting { entity, a, b }
            }
            defect => GeometryError::Degenerate { entity, defect },
        }
    }
}

/// Invalid routing parameters. Always detected before any search starts.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("resolution {resolution} is coarser than the smallest clearance {clearance}")]
    ResolutionTooCoarse { resolution: f64, clearance: f64 },

    #[error("connectivity must be 4 or 8, got {0}")]
    InvalidConnectivity(u8),

    #[error("turn penalty must be finite and non-negative, got {0}")]
    InvalidTurnPenalty(f64),

    #[error("{name} must be finite and non-negative, got {value}")]
    InvalidCost { name: &'static str, value: f64 },

    #[error("clearance for {name} must be positive and finite, got {value}")]
    InvalidClearance { name: String, value: f64 },

    #[error("unknown discipline '{0}' in rule table")]
    UnknownDiscipline(String),

    #[error("speculative batch size must be at least 1")]
    EmptySpeculativeBatch,
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid scene JSON: {0}")]
    Json(#[from] serde_json::Error),
}
