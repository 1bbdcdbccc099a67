//! Declarative hierarchy loader.
//!
//! Reads a CSV sample state file one row at a time. Each row is a partial specification of a
//! node and its ancestors: the loader infers the deepest level whose identifying fields are all
//! present, upserts every level from the plate down, and attaches the remaining columns to the
//! deepest node as attributes.
//!
//! ```text
//! plate_name,well_x,well_y,field_x,field_y,channel_id,gain
//! 00,1,1,1,1,,          -> plate 00 / well 1,1 / field 1,1
//! 00,1,1,,,0,800        -> plate 00 / well 1,1 / channel 0 {gain: "800"}
//! ```
//!
//! A bad row never aborts the load. It is logged, recorded in the [`LoadReport`] with its line
//! number, and the next row is processed.

use super::key::{
    canonical_field, fields_for, KeyFields, NodeKind, Segment, CHANNEL_ID, CHANNEL_NAME,
};
use super::store::{Attributes, NodeRef, SampleStore};
use crate::error::{FlowError, FlowResult};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Optional discriminator column naming the row's level.
const NAME_COLUMN: &str = "name";

/// A row that could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowFailure {
    /// 1-based line in the file (the header is line 1).
    pub line: usize,
    /// Why the row was rejected.
    pub reason: String,
}

/// Outcome of loading a whole file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Data rows seen, excluding the header.
    pub rows: usize,
    /// Rows applied to the hierarchy.
    pub loaded: usize,
    /// Nodes that did not exist before the load.
    pub nodes_created: usize,
    /// Rejected rows, in file order.
    pub failures: Vec<RowFailure>,
}

impl LoadReport {
    /// True when no row was rejected.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Fails only when there were rows and none of them produced a node.
    pub fn into_result(self) -> FlowResult<Self> {
        if self.rows > 0 && self.loaded == 0 {
            return Err(FlowError::NothingLoaded {
                failed: self.failures.len(),
            });
        }
        Ok(self)
    }

    fn fail(&mut self, line: usize, reason: String) {
        warn!("Skipping sample state row {}: {}", line, reason);
        self.failures.push(RowFailure { line, reason });
    }
}

#[derive(Debug, Clone)]
enum Column {
    Identifying(&'static str),
    Discriminator,
    Attribute(String),
    Ignored,
}

#[derive(Debug)]
struct Header {
    columns: Vec<Column>,
}

impl Header {
    fn parse(names: &csv::StringRecord) -> FlowResult<Self> {
        let columns: Vec<Column> = names
            .iter()
            .map(|name| {
                let name = name.trim();
                if name.is_empty() {
                    Column::Ignored
                } else if let Some(field) = canonical_field(name) {
                    Column::Identifying(field)
                } else if name.eq_ignore_ascii_case(NAME_COLUMN) {
                    Column::Discriminator
                } else {
                    Column::Attribute(name.to_string())
                }
            })
            .collect();

        if columns.iter().all(|c| matches!(c, Column::Ignored)) {
            return Err(FlowError::Validation(
                "sample state file has no header row".to_string(),
            ));
        }
        if !columns
            .iter()
            .any(|c| matches!(c, Column::Identifying(f) if *f == super::key::PLATE_NAME))
        {
            warn!("Sample state header has no 'plate_name' column; every row will be rejected");
        }
        Ok(Self { columns })
    }

    fn row<'a>(&self, line: usize, cells: impl Iterator<Item = &'a str>) -> Row {
        let mut row = Row::new(line);
        for (column, value) in self.columns.iter().zip(cells) {
            match column {
                Column::Identifying(field) => {
                    row.fields.insert(field.to_string(), value.to_string());
                }
                Column::Discriminator => row.declared_kind = Some(value.to_string()),
                Column::Attribute(name) => row.set_attribute(name, value),
                Column::Ignored => {}
            }
        }
        row
    }
}

/// One declarative row split into identifying fields and free-form attributes.
#[derive(Debug, Clone, Default)]
pub struct Row {
    /// Line number, for diagnostics.
    pub line: usize,
    /// Identifying fields, keyed by canonical name.
    pub fields: KeyFields,
    /// Non-empty attribute cells.
    pub attributes: Attributes,
    /// Value of the optional `name` column.
    pub declared_kind: Option<String>,
}

impl Row {
    /// An empty row at `line`.
    pub fn new(line: usize) -> Self {
        Self {
            line,
            ..Self::default()
        }
    }

    /// Builds a row from column/value pairs, sorting them the same way a CSV header would.
    pub fn from_pairs<K, V>(line: usize, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut row = Self::new(line);
        for (name, value) in pairs {
            let (name, value) = (name.as_ref().trim(), value.as_ref());
            if let Some(field) = canonical_field(name) {
                row.fields.insert(field.to_string(), value.to_string());
            } else if name.eq_ignore_ascii_case(NAME_COLUMN) {
                row.declared_kind = Some(value.to_string());
            } else if !name.is_empty() {
                row.set_attribute(name, value);
            }
        }
        row
    }

    /// Empty cells are not attributes; they leave existing values untouched.
    fn set_attribute(&mut self, name: &str, value: &str) {
        let value = value.trim();
        if !value.is_empty() {
            self.attributes
                .insert(name.to_string(), Value::String(value.to_string()));
        }
    }
}

/// Builds the sample hierarchy from declarative rows.
pub struct HierarchyLoader {
    store: Arc<SampleStore>,
}

impl HierarchyLoader {
    /// A loader writing into `store`.
    pub fn new(store: Arc<SampleStore>) -> Self {
        Self { store }
    }

    /// The hierarchy being built.
    pub fn store(&self) -> &Arc<SampleStore> {
        &self.store
    }

    /// Loads a CSV file from disk.
    pub fn load_path<P: AsRef<Path>>(&self, path: P) -> FlowResult<LoadReport> {
        let path = path.as_ref();
        info!("Loading sample state from '{}'", path.display());
        let file = File::open(path)?;
        self.load_reader(file)
    }

    /// Loads CSV text from any reader.
    ///
    /// Only an unreadable header is an error; row problems are collected in the report.
    pub fn load_reader<R: Read>(&self, reader: R) -> FlowResult<LoadReport> {
        let mut csv = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let header = Header::parse(csv.headers()?)?;

        let before = self.store.len();
        let mut report = LoadReport::default();
        for (idx, result) in csv.records().enumerate() {
            let fallback_line = idx + 2;
            report.rows += 1;

            let record = match result {
                Ok(record) => record,
                Err(err) => {
                    let line = err
                        .position()
                        .map_or(fallback_line, |pos| pos.line() as usize);
                    report.fail(line, err.to_string());
                    continue;
                }
            };
            let line = record
                .position()
                .map_or(fallback_line, |pos| pos.line() as usize);
            if record.len() > header.columns.len() {
                report.fail(
                    line,
                    format!(
                        "row has {} cells but the header names {}",
                        record.len(),
                        header.columns.len()
                    ),
                );
                continue;
            }

            let row = header.row(line, record.iter());
            match self.load_row(&row) {
                Ok(node) => {
                    debug!("Row {} -> {} '{}'", line, node.kind(), node.path());
                    report.loaded += 1;
                }
                Err(err) => report.fail(line, reason_of(err)),
            }
        }
        report.nodes_created = self.store.len().saturating_sub(before);

        info!(
            "Loaded {} of {} sample state rows ({} nodes created, {} failed)",
            report.loaded,
            report.rows,
            report.nodes_created,
            report.failures.len()
        );
        Ok(report)
    }

    /// Loads rows that did not come from a file, e.g. a generated plate layout.
    pub fn load_records(&self, rows: impl IntoIterator<Item = Row>) -> LoadReport {
        let before = self.store.len();
        let mut report = LoadReport::default();
        for row in rows {
            report.rows += 1;
            match self.load_row(&row) {
                Ok(_) => report.loaded += 1,
                Err(err) => report.fail(row.line, reason_of(err)),
            }
        }
        report.nodes_created = self.store.len().saturating_sub(before);
        report
    }

    /// Applies one row: every implied ancestor, then the deepest node with the row's attributes.
    ///
    /// All identifying fields are checked before the store is touched, so a rejected row
    /// creates nothing.
    pub fn load_row(&self, row: &Row) -> FlowResult<NodeRef> {
        let malformed = |err: FlowError| FlowError::MalformedRow {
            line: row.line,
            reason: reason_of(err),
        };

        let chain = NodeKind::chain_for(&row.fields).map_err(malformed)?;
        let levels: Vec<(NodeKind, KeyFields)> = chain
            .iter()
            .map(|kind| (*kind, fields_for(*kind, &row.fields)))
            .collect();
        for (kind, fields) in &levels {
            Segment::parse(*kind, fields).map_err(malformed)?;
        }

        let deepest = chain.last().copied().unwrap_or(NodeKind::Plate);
        if let Some(declared) = row.declared_kind.as_deref().filter(|d| !d.trim().is_empty()) {
            match NodeKind::parse(declared) {
                Some(kind) if kind == deepest => {}
                Some(kind) => warn!(
                    "Row {} is declared as {} but specifies a {}; using {}",
                    row.line, kind, deepest, deepest
                ),
                None => warn!("Row {} has unknown name '{}'", row.line, declared),
            }
        }

        let mut parent = None;
        let mut deepest_node = None;
        for (kind, fields) in levels {
            let mut attributes = Attributes::new();
            if kind == NodeKind::Channel && fields.contains_key(CHANNEL_ID) {
                if let Some(name) = fields.get(CHANNEL_NAME).filter(|n| !n.trim().is_empty()) {
                    attributes.insert(CHANNEL_NAME.to_string(), Value::String(name.clone()));
                }
            }
            if kind == deepest {
                attributes.extend(row.attributes.clone());
            }
            let node = self
                .store
                .upsert(kind, parent.as_ref(), &fields, attributes)
                .map_err(malformed)?;
            parent = Some(node.path().clone());
            deepest_node = Some(node);
        }

        deepest_node.ok_or_else(|| FlowError::MalformedRow {
            line: row.line,
            reason: "row specifies no node".to_string(),
        })
    }
}

/// Wells of a full plate, row-major over `x`, as synthetic rows.
pub fn plate_layout_rows(plate_name: &str, x_wells: u32, y_wells: u32) -> Vec<Row> {
    (0..x_wells)
        .flat_map(|x| (0..y_wells).map(move |y| (x, y)))
        .enumerate()
        .map(|(idx, (x, y))| {
            let mut pairs = BTreeMap::new();
            pairs.insert(super::key::PLATE_NAME, plate_name.to_string());
            pairs.insert(super::key::WELL_X, x.to_string());
            pairs.insert(super::key::WELL_Y, y.to_string());
            Row::from_pairs(idx + 1, pairs)
        })
        .collect()
}

fn reason_of(err: FlowError) -> String {
    match err {
        FlowError::Validation(reason) | FlowError::MalformedRow { reason, .. } => reason,
        other => other.to_string(),
    }
}
