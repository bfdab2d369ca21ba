use uuid::Uuid;

use basalt_cql::frame::request::query::PagingStateResponse;
use basalt_cql::frame::response::result::{self, ColumnSpec, CqlValue, Row};

/// The result of a single request, as returned to the caller.
#[derive(Debug)]
pub struct QueryResult {
    rows: Option<Vec<Row>>,
    col_specs: Vec<ColumnSpec>,
    warnings: Vec<String>,
    tracing_id: Option<Uuid>,
    paging_state_response: PagingStateResponse,
}

impl QueryResult {
    pub(crate) fn from_result(
        result: result::Result,
        tracing_id: Option<Uuid>,
        warnings: Vec<String>,
    ) -> Self {
        match result {
            result::Result::Rows(rows) => {
                let paging_state_response = PagingStateResponse::new_from_raw_bytes(
                    rows.metadata.paging_state.as_deref(),
                );
                QueryResult {
                    rows: Some(rows.rows),
                    col_specs: rows.metadata.col_specs,
                    warnings,
                    tracing_id,
                    paging_state_response,
                }
            }
            _ => QueryResult {
                rows: None,
                col_specs: Vec::new(),
                warnings,
                tracing_id,
                paging_state_response: PagingStateResponse::NoMorePages,
            },
        }
    }

    pub(crate) fn mock_empty(tracing_id: Option<Uuid>, warnings: Vec<String>) -> Self {
        QueryResult {
            rows: None,
            col_specs: Vec::new(),
            warnings,
            tracing_id,
            paging_state_response: PagingStateResponse::NoMorePages,
        }
    }

    /// Rows of the result; None when the response carried no rows (e.g.
    /// a write).
    pub fn rows(&self) -> Option<&[Row]> {
        self.rows.as_deref()
    }

    /// Consumes the result, returning its rows.
    pub fn into_rows(self) -> Option<Vec<Row>> {
        self.rows
    }

    pub fn rows_num(&self) -> usize {
        self.rows.as_ref().map(Vec::len).unwrap_or(0)
    }

    /// The first row, if any.
    pub fn first_row(&self) -> Option<&Row> {
        self.rows.as_ref().and_then(|rows| rows.first())
    }

    /// Value of the given column of the first row.
    pub fn first_row_column(&self, column: usize) -> Option<&CqlValue> {
        self.first_row()
            .and_then(|row| row.columns.get(column))
            .and_then(Option::as_ref)
    }

    /// Column specifications of the result rows.
    pub fn col_specs(&self) -> &[ColumnSpec] {
        &self.col_specs
    }

    /// Warnings the server attached to the response.
    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.warnings.iter().map(String::as_str)
    }

    /// Tracing id of the request, if tracing was enabled.
    pub fn tracing_id(&self) -> Option<Uuid> {
        self.tracing_id
    }

    /// Whether the server signalled more pages after this one.
    pub fn paging_state_response(&self) -> &PagingStateResponse {
        &self.paging_state_response
    }
}
