use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

/// Backend-agnostic columnar table: the intermediate representation data
/// passes through between a database read and a library-specific dataframe.
#[derive(Debug, Clone)]
pub struct ArrowTable {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
}

impl ArrowTable {
    pub fn new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self { schema, batches }
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }
}

/// Encoding a geometry-aware read used for its geometry columns; tells the
/// converter how to decode them into typed geometry values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoFormat {
    /// Well-known binary, read as `<fn>(col) AS col_wkb` projections.
    Wkb,
    /// GeoJSON text, read from the geometry column as-is.
    GeoJson,
}

/// Arrow table with geometry column metadata.
///
/// All geometry columns in one result share a single spatial reference id.
#[derive(Debug, Clone)]
pub struct GeoArrowResult {
    pub table: ArrowTable,
    pub geometry_columns: Vec<String>,
    pub srid: i32,
    pub format: GeoFormat,
}

/// Output of a reader: a plain columnar table, or one with a geometry sidecar.
#[derive(Debug, Clone)]
pub enum ReadData {
    Table(ArrowTable),
    Geo(GeoArrowResult),
}

impl ReadData {
    pub fn table(&self) -> &ArrowTable {
        match self {
            ReadData::Table(t) => t,
            ReadData::Geo(g) => &g.table,
        }
    }
}
