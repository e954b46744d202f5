//! Query builder for queued operations.
//!
//! [`QueueQuery`] filters the operation queue for diagnostics and UI
//! listings. Results always come back in replay order: priority descending,
//! then enqueue time ascending, then insertion order.
//!
//! # Example
//!
//! ```
//! use chapel_store::{QueueQuery, Store};
//! use chapel_types::Priority;
//!
//! let store = Store::open_in_memory()?;
//!
//! let query = QueueQuery::new()
//!     .category("tasks")
//!     .min_priority(Priority::Normal)
//!     .limit(20);
//!
//! let ops = store.query_operations(&query)?;
//! assert!(ops.is_empty());
//! # Ok::<(), chapel_store::Error>(())
//! ```

use chapel_types::{OperationType, Priority};

/// Fluent query builder for queued operations.
///
/// All filters are optional. An empty query matches the whole queue.
#[derive(Debug, Default, Clone)]
pub struct QueueQuery {
    /// Filter by metadata category.
    pub category: Option<String>,
    /// Only include operations at or above this priority.
    pub min_priority: Option<Priority>,
    /// Filter by operation type.
    pub op_type: Option<OperationType>,
    /// Only include endpoints starting with this prefix.
    pub endpoint_prefix: Option<String>,
    /// Only include operations that have failed at least once.
    pub retrying_only: bool,
    /// Maximum number of results.
    pub limit: Option<u32>,
}

impl QueueQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category(mut self, category: &str) -> Self {
        self.category = Some(category.to_string());
        self
    }

    pub fn min_priority(mut self, priority: Priority) -> Self {
        self.min_priority = Some(priority);
        self
    }

    pub fn op_type(mut self, op_type: OperationType) -> Self {
        self.op_type = Some(op_type);
        self
    }

    /// Filter to endpoints under `prefix` (e.g. `/api/tasks`).
    pub fn endpoint_prefix(mut self, prefix: &str) -> Self {
        self.endpoint_prefix = Some(prefix.to_string());
        self
    }

    pub fn retrying_only(mut self) -> Self {
        self.retrying_only = true;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Build the SQL WHERE clause and parameters.
    pub(crate) fn build_where(&self) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref category) = self.category {
            conditions.push("category = ?");
            params.push(Box::new(category.clone()));
        }

        if let Some(priority) = self.min_priority {
            conditions.push("priority >= ?");
            params.push(Box::new(priority.rank()));
        }

        if let Some(op_type) = self.op_type {
            conditions.push("op_type = ?");
            params.push(Box::new(op_type.as_str()));
        }

        if let Some(ref prefix) = self.endpoint_prefix {
            conditions.push("substr(endpoint, 1, length(?)) = ?");
            params.push(Box::new(prefix.clone()));
            params.push(Box::new(prefix.clone()));
        }

        if self.retrying_only {
            conditions.push("retry_count > 0");
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    /// Build the full SQL query.
    pub(crate) fn build_sql(&self) -> String {
        let (where_clause, _) = self.build_where();

        let mut sql = format!(
            "SELECT id, op_type, endpoint, method, payload, headers, priority, retry_count, \
             max_retries, last_error, last_retry_time, enqueued_at, category, description \
             FROM operation_queue {} ORDER BY priority DESC, enqueued_at ASC, seq ASC",
            where_clause
        );

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        sql
    }
}
