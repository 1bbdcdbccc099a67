//! Identifying fields and container paths.
//!
//! A node is addressed by the chain of identifying fields of itself and all of its ancestors,
//! from the plate down. `ContainerPath` is that chain in typed form; `KeyFields` is the loose,
//! string-keyed form that arrives from declarative rows and inbound events.

use crate::error::{FlowError, FlowResult};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Plate name column.
pub const PLATE_NAME: &str = "plate_name";
/// Well column index.
pub const WELL_X: &str = "well_x";
/// Well row index.
pub const WELL_Y: &str = "well_y";
/// Field column index.
pub const FIELD_X: &str = "field_x";
/// Field row index.
pub const FIELD_Y: &str = "field_y";
/// Numeric channel id.
pub const CHANNEL_ID: &str = "channel_id";
/// Channel name.
pub const CHANNEL_NAME: &str = "channel_name";
/// Z-slice index.
pub const Z_SLICE: &str = "z_slice";

/// Older image events name the z index `z_slice_id`.
const Z_SLICE_ALIAS: &str = "z_slice_id";

/// Every field name that takes part in node identity.
pub const IDENTIFYING_FIELDS: [&str; 8] = [
    PLATE_NAME,
    WELL_X,
    WELL_Y,
    FIELD_X,
    FIELD_Y,
    CHANNEL_ID,
    CHANNEL_NAME,
    Z_SLICE,
];

/// Loose identifying fields, keyed by field name.
pub type KeyFields = BTreeMap<String, String>;

/// Maps a column or payload name onto its canonical identifying field, if it is one.
pub fn canonical_field(name: &str) -> Option<&'static str> {
    let lowered = name.trim().to_ascii_lowercase();
    if lowered == Z_SLICE_ALIAS {
        return Some(Z_SLICE);
    }
    IDENTIFYING_FIELDS.iter().copied().find(|f| *f == lowered)
}

/// Container levels, coarsest first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// A multi-well plate, keyed by name.
    Plate,
    /// A well, keyed by grid position.
    Well,
    /// An imaging field inside a well.
    Field,
    /// A channel, keyed by index or name.
    Channel,
    /// A z-slice, keyed by index.
    ZSlice,
}

impl NodeKind {
    /// All kinds in hierarchy order.
    pub const ALL: [NodeKind; 5] = [
        NodeKind::Plate,
        NodeKind::Well,
        NodeKind::Field,
        NodeKind::Channel,
        NodeKind::ZSlice,
    ];

    /// Snake-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Plate => "plate",
            NodeKind::Well => "well",
            NodeKind::Field => "field",
            NodeKind::Channel => "channel",
            NodeKind::ZSlice => "z_slice",
        }
    }

    /// Parses a kind name as written in configuration or a `name` column.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "plate" => Some(NodeKind::Plate),
            "well" => Some(NodeKind::Well),
            "field" => Some(NodeKind::Field),
            "channel" => Some(NodeKind::Channel),
            "z_slice" | "zslice" | "z" => Some(NodeKind::ZSlice),
            _ => None,
        }
    }

    /// Identifying fields owned by this level.
    ///
    /// A channel needs only one of `channel_id` / `channel_name`.
    pub fn identifying_fields(&self) -> &'static [&'static str] {
        match self {
            NodeKind::Plate => &[PLATE_NAME],
            NodeKind::Well => &[WELL_X, WELL_Y],
            NodeKind::Field => &[FIELD_X, FIELD_Y],
            NodeKind::Channel => &[CHANNEL_ID, CHANNEL_NAME],
            NodeKind::ZSlice => &[Z_SLICE],
        }
    }

    /// Whether a node of this kind may directly own a node of `child` kind.
    pub fn can_own(&self, child: NodeKind) -> bool {
        matches!(
            (self, child),
            (NodeKind::Plate, NodeKind::Well)
                | (NodeKind::Well, NodeKind::Field)
                | (NodeKind::Well, NodeKind::Channel)
                | (NodeKind::Field, NodeKind::Channel)
                | (NodeKind::Field, NodeKind::ZSlice)
                | (NodeKind::Channel, NodeKind::ZSlice)
        )
    }

    /// Infers the chain of levels a set of identifying fields specifies, plate first.
    ///
    /// The last entry is the deepest level whose full identifying set is present. Coordinate
    /// pairs must be complete and every level must have a parent that can own it.
    pub fn chain_for(fields: &KeyFields) -> FlowResult<Vec<NodeKind>> {
        let has = |name: &str| fields.get(name).is_some_and(|v| !v.trim().is_empty());

        if !has(PLATE_NAME) {
            return Err(FlowError::Validation(format!("missing '{}'", PLATE_NAME)));
        }
        let mut chain = vec![NodeKind::Plate];

        for (kind, x, y) in [
            (NodeKind::Well, WELL_X, WELL_Y),
            (NodeKind::Field, FIELD_X, FIELD_Y),
        ] {
            match (has(x), has(y)) {
                (true, true) => chain.push(kind),
                (false, false) => {}
                _ => {
                    return Err(FlowError::Validation(format!(
                        "incomplete {} coordinates: '{}' and '{}' must both be set",
                        kind, x, y
                    )))
                }
            }
        }
        if has(CHANNEL_ID) || has(CHANNEL_NAME) {
            chain.push(NodeKind::Channel);
        }
        if has(Z_SLICE) {
            chain.push(NodeKind::ZSlice);
        }

        for pair in chain.windows(2) {
            if !pair[0].can_own(pair[1]) {
                return Err(FlowError::Validation(format!(
                    "a {} cannot be placed directly under a {}",
                    pair[1], pair[0]
                )));
            }
        }
        Ok(chain)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel identity: numeric index when known, otherwise the channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelId {
    /// Numeric channel index.
    Index(u32),
    /// Channel name such as `green`.
    Name(String),
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Index(idx) => write!(f, "{}", idx),
            ChannelId::Name(name) => f.write_str(name),
        }
    }
}

/// One level of a container path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    /// Plate name.
    Plate(String),
    /// Well position.
    Well {
        /// Column.
        x: u32,
        /// Row.
        y: u32,
    },
    /// Field position.
    Field {
        /// Column.
        x: u32,
        /// Row.
        y: u32,
    },
    /// Channel identity.
    Channel(ChannelId),
    /// Z index.
    ZSlice(u32),
}

impl Segment {
    /// Level this segment addresses.
    pub fn kind(&self) -> NodeKind {
        match self {
            Segment::Plate(_) => NodeKind::Plate,
            Segment::Well { .. } => NodeKind::Well,
            Segment::Field { .. } => NodeKind::Field,
            Segment::Channel(_) => NodeKind::Channel,
            Segment::ZSlice(_) => NodeKind::ZSlice,
        }
    }

    /// Builds the segment of `kind` from its identifying fields.
    ///
    /// Only the fields owned by `kind` are read.
    pub fn parse(kind: NodeKind, fields: &KeyFields) -> FlowResult<Self> {
        match kind {
            NodeKind::Plate => Ok(Segment::Plate(required(fields, kind, PLATE_NAME)?.to_string())),
            NodeKind::Well => Ok(Segment::Well {
                x: coordinate(fields, kind, WELL_X)?,
                y: coordinate(fields, kind, WELL_Y)?,
            }),
            NodeKind::Field => Ok(Segment::Field {
                x: coordinate(fields, kind, FIELD_X)?,
                y: coordinate(fields, kind, FIELD_Y)?,
            }),
            NodeKind::Channel => {
                if let Some(id) = optional(fields, CHANNEL_ID) {
                    Ok(Segment::Channel(ChannelId::Index(parse_index(CHANNEL_ID, id)?)))
                } else if let Some(name) = optional(fields, CHANNEL_NAME) {
                    Ok(Segment::Channel(ChannelId::Name(name.to_string())))
                } else {
                    Err(FlowError::Validation(format!(
                        "missing identifying field '{}' or '{}' for channel",
                        CHANNEL_ID, CHANNEL_NAME
                    )))
                }
            }
            NodeKind::ZSlice => Ok(Segment::ZSlice(coordinate(fields, kind, Z_SLICE)?)),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Plate(name) => f.write_str(name),
            Segment::Well { x, y } => write!(f, "W{},{}", x, y),
            Segment::Field { x, y } => write!(f, "F{},{}", x, y),
            Segment::Channel(id) => write!(f, "C{}", id),
            Segment::ZSlice(z) => write!(f, "Z{}", z),
        }
    }
}

fn optional<'a>(fields: &'a KeyFields, name: &str) -> Option<&'a str> {
    fields
        .get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn required<'a>(fields: &'a KeyFields, kind: NodeKind, name: &str) -> FlowResult<&'a str> {
    optional(fields, name).ok_or_else(|| {
        FlowError::Validation(format!("missing identifying field '{}' for {}", name, kind))
    })
}

fn coordinate(fields: &KeyFields, kind: NodeKind, name: &str) -> FlowResult<u32> {
    parse_index(name, required(fields, kind, name)?)
}

fn parse_index(name: &str, value: &str) -> FlowResult<u32> {
    value.parse::<u32>().map_err(|_| {
        FlowError::Validation(format!(
            "'{}' must be a non-negative integer, got '{}'",
            name, value
        ))
    })
}

/// Typed address of a node: its segment and those of all ancestors, plate first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerPath {
    segments: Vec<Segment>,
}

impl ContainerPath {
    /// Path of a plate.
    pub fn plate(name: impl Into<String>) -> Self {
        Self {
            segments: vec![Segment::Plate(name.into())],
        }
    }

    /// Path made of a single root segment, which must be a plate.
    pub fn root(segment: Segment) -> FlowResult<Self> {
        match segment {
            Segment::Plate(_) => Ok(Self {
                segments: vec![segment],
            }),
            other => Err(FlowError::Validation(format!(
                "a {} cannot be the root of a path",
                other.kind()
            ))),
        }
    }

    /// Path of a direct child of this node.
    pub fn child(&self, segment: Segment) -> FlowResult<Self> {
        let parent = self.kind();
        if !parent.can_own(segment.kind()) {
            return Err(FlowError::Validation(format!(
                "a {} cannot be placed directly under a {} ('{}')",
                segment.kind(),
                parent,
                self
            )));
        }
        let mut segments = self.segments.clone();
        segments.push(segment);
        Ok(Self { segments })
    }

    /// Path of the well at `x`, `y` below this node.
    pub fn well(&self, x: u32, y: u32) -> FlowResult<Self> {
        self.child(Segment::Well { x, y })
    }

    /// Path of the field at `x`, `y` below this node.
    pub fn field(&self, x: u32, y: u32) -> FlowResult<Self> {
        self.child(Segment::Field { x, y })
    }

    /// Path of the channel with index `id` below this node.
    pub fn channel(&self, id: u32) -> FlowResult<Self> {
        self.child(Segment::Channel(ChannelId::Index(id)))
    }

    /// Path of the named channel below this node.
    pub fn channel_named(&self, name: impl Into<String>) -> FlowResult<Self> {
        self.child(Segment::Channel(ChannelId::Name(name.into())))
    }

    /// Path of z-slice `z` below this node.
    pub fn z_slice(&self, z: u32) -> FlowResult<Self> {
        self.child(Segment::ZSlice(z))
    }

    /// Resolves the deepest node fully specified by loose identifying fields.
    pub fn from_fields(fields: &KeyFields) -> FlowResult<Self> {
        let chain = NodeKind::chain_for(fields)?;
        let segments = chain
            .into_iter()
            .map(|kind| Segment::parse(kind, fields))
            .collect::<FlowResult<Vec<_>>>()?;
        Ok(Self { segments })
    }

    /// Resolves an ordered identifying-field sequence, as carried by inbound events.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> FlowResult<Self>
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut fields = KeyFields::new();
        for (name, value) in pairs {
            let canonical = canonical_field(name.as_ref()).ok_or_else(|| {
                FlowError::Validation(format!(
                    "'{}' is not an identifying field",
                    name.as_ref()
                ))
            })?;
            fields.insert(canonical.to_string(), value.into());
        }
        Self::from_fields(&fields)
    }

    /// Level of the node.
    pub fn kind(&self) -> NodeKind {
        self.leaf().kind()
    }

    /// The last segment.
    pub fn leaf(&self) -> &Segment {
        // Construction guarantees at least the plate segment.
        &self.segments[self.segments.len() - 1]
    }

    /// Every level, plate first.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of levels, 1 for a plate.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Path of the parent; `None` for a plate.
    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() < 2 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Paths of this node and every ancestor, plate first.
    pub fn prefixes(&self) -> impl Iterator<Item = ContainerPath> + '_ {
        (1..=self.segments.len()).map(move |len| Self {
            segments: self.segments[..len].to_vec(),
        })
    }

    /// True if `other` lies strictly below this path.
    pub fn is_ancestor_of(&self, other: &ContainerPath) -> bool {
        other.segments.len() > self.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// Name of the plate this path starts at.
    pub fn plate_name(&self) -> &str {
        match &self.segments[0] {
            Segment::Plate(name) => name,
            _ => "",
        }
    }

    /// Coordinates of the well segment, if any.
    pub fn well_coords(&self) -> Option<(u32, u32)> {
        self.segments.iter().find_map(|s| match s {
            Segment::Well { x, y } => Some((*x, *y)),
            _ => None,
        })
    }

    /// Coordinates of the field segment, if any.
    pub fn field_coords(&self) -> Option<(u32, u32)> {
        self.segments.iter().find_map(|s| match s {
            Segment::Field { x, y } => Some((*x, *y)),
            _ => None,
        })
    }

    /// Channel of the path, if any.
    pub fn channel_id(&self) -> Option<&ChannelId> {
        self.segments.iter().find_map(|s| match s {
            Segment::Channel(id) => Some(id),
            _ => None,
        })
    }

    /// Z index of the path, if any.
    pub fn z_index(&self) -> Option<u32> {
        self.segments.iter().find_map(|s| match s {
            Segment::ZSlice(z) => Some(*z),
            _ => None,
        })
    }

    /// Identifying fields of the whole chain, the inverse of [`ContainerPath::from_fields`].
    pub fn to_fields(&self) -> KeyFields {
        let mut fields = KeyFields::new();
        for segment in &self.segments {
            match segment {
                Segment::Plate(name) => {
                    fields.insert(PLATE_NAME.into(), name.clone());
                }
                Segment::Well { x, y } => {
                    fields.insert(WELL_X.into(), x.to_string());
                    fields.insert(WELL_Y.into(), y.to_string());
                }
                Segment::Field { x, y } => {
                    fields.insert(FIELD_X.into(), x.to_string());
                    fields.insert(FIELD_Y.into(), y.to_string());
                }
                Segment::Channel(ChannelId::Index(idx)) => {
                    fields.insert(CHANNEL_ID.into(), idx.to_string());
                }
                Segment::Channel(ChannelId::Name(name)) => {
                    fields.insert(CHANNEL_NAME.into(), name.clone());
                }
                Segment::ZSlice(z) => {
                    fields.insert(Z_SLICE.into(), z.to_string());
                }
            }
        }
        fields
    }
}

impl fmt::Display for ContainerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, segment) in self.segments.iter().enumerate() {
            if idx > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}

impl Serialize for ContainerPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Identifying fields of `row` that belong to `kind`.
pub fn fields_for(kind: NodeKind, row: &KeyFields) -> KeyFields {
    kind.identifying_fields()
        .iter()
        .filter_map(|name| row.get(*name).map(|v| (name.to_string(), v.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> KeyFields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_chain_for_channel_row() {
        let row = fields(&[
            (PLATE_NAME, "00"),
            (WELL_X, "1"),
            (WELL_Y, "1"),
            (CHANNEL_ID, "0"),
        ]);
        assert_eq!(
            NodeKind::chain_for(&row).unwrap(),
            vec![NodeKind::Plate, NodeKind::Well, NodeKind::Channel]
        );
    }

    #[test]
    fn test_chain_for_field_row() {
        let row = fields(&[
            (PLATE_NAME, "00"),
            (WELL_X, "1"),
            (WELL_Y, "1"),
            (FIELD_X, "0"),
            (FIELD_Y, "2"),
        ]);
        assert_eq!(
            NodeKind::chain_for(&row).unwrap().last(),
            Some(&NodeKind::Field)
        );
    }

    #[test]
    fn test_chain_rejects_missing_plate() {
        let row = fields(&[(WELL_X, "1"), (WELL_Y, "1")]);
        assert!(matches!(
            NodeKind::chain_for(&row),
            Err(FlowError::Validation(_))
        ));
    }

    #[test]
    fn test_chain_rejects_half_coordinates() {
        let row = fields(&[(PLATE_NAME, "00"), (WELL_X, "1")]);
        let err = NodeKind::chain_for(&row).unwrap_err();
        assert!(err.to_string().contains("incomplete well coordinates"));
    }

    #[test]
    fn test_chain_rejects_orphan_levels() {
        let field_without_well = fields(&[(PLATE_NAME, "00"), (FIELD_X, "1"), (FIELD_Y, "1")]);
        assert!(NodeKind::chain_for(&field_without_well).is_err());

        let z_under_well = fields(&[
            (PLATE_NAME, "00"),
            (WELL_X, "1"),
            (WELL_Y, "1"),
            (Z_SLICE, "3"),
        ]);
        assert!(NodeKind::chain_for(&z_under_well).is_err());
    }

    #[test]
    fn test_empty_values_count_as_absent() {
        let row = fields(&[
            (PLATE_NAME, "00"),
            (WELL_X, "0"),
            (WELL_Y, "1"),
            (FIELD_X, ""),
            (FIELD_Y, " "),
        ]);
        assert_eq!(
            NodeKind::chain_for(&row).unwrap(),
            vec![NodeKind::Plate, NodeKind::Well]
        );
    }

    #[test]
    fn test_channel_prefers_id_over_name() {
        let row = fields(&[(CHANNEL_ID, "2"), (CHANNEL_NAME, "red")]);
        assert_eq!(
            Segment::parse(NodeKind::Channel, &row).unwrap(),
            Segment::Channel(ChannelId::Index(2))
        );
        let row = fields(&[(CHANNEL_NAME, "red")]);
        assert_eq!(
            Segment::parse(NodeKind::Channel, &row).unwrap(),
            Segment::Channel(ChannelId::Name("red".into()))
        );
    }

    #[test]
    fn test_non_integer_coordinate() {
        let row = fields(&[(WELL_X, "a"), (WELL_Y, "1")]);
        let err = Segment::parse(NodeKind::Well, &row).unwrap_err();
        assert!(err.to_string().contains("'well_x' must be a non-negative integer"));
    }

    #[test]
    fn test_path_round_trips_through_fields() {
        let path = ContainerPath::plate("00")
            .well(1, 2)
            .and_then(|p| p.field(0, 1))
            .and_then(|p| p.channel(3))
            .unwrap();
        assert_eq!(ContainerPath::from_fields(&path.to_fields()).unwrap(), path);
        assert_eq!(path.to_string(), "00/W1,2/F0,1/C3");
    }

    #[test]
    fn test_from_pairs_accepts_alias() {
        let path = ContainerPath::from_pairs([
            ("plate_name", "00"),
            ("well_x", "0"),
            ("well_y", "0"),
            ("field_x", "1"),
            ("field_y", "1"),
            ("z_slice_id", "4"),
        ])
        .unwrap();
        assert_eq!(path.kind(), NodeKind::ZSlice);
        assert_eq!(path.z_index(), Some(4));
    }

    #[test]
    fn test_from_pairs_rejects_unknown_field() {
        assert!(ContainerPath::from_pairs([("plate_name", "00"), ("gain", "800")]).is_err());
    }

    #[test]
    fn test_child_enforces_ownership() {
        let plate = ContainerPath::plate("00");
        assert!(plate.field(0, 0).is_err());
        assert!(plate.channel(0).is_err());
        let well = plate.well(0, 0).unwrap();
        assert!(well.channel(0).is_ok());
        assert!(well.z_slice(0).is_err());
    }

    #[test]
    fn test_prefixes_and_parent() {
        let path = ContainerPath::plate("00")
            .well(1, 1)
            .and_then(|p| p.field(1, 1))
            .unwrap();
        let prefixes: Vec<_> = path.prefixes().map(|p| p.kind()).collect();
        assert_eq!(prefixes, vec![NodeKind::Plate, NodeKind::Well, NodeKind::Field]);
        assert_eq!(path.parent().unwrap().kind(), NodeKind::Well);
        assert!(ContainerPath::plate("00").parent().is_none());
        assert!(ContainerPath::plate("00").is_ancestor_of(&path));
    }
}
