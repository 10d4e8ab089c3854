use serde_json::Value;

use crate::error::{PortalError, PortalResult};

/// Typed value for an equality filter
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl FilterValue {
    fn render(&self) -> String {
        match self {
            FilterValue::Str(s) => s.clone(),
            FilterValue::Int(i) => i.to_string(),
            FilterValue::Bool(b) => b.to_string(),
        }
    }

    pub fn matches(&self, value: Option<&Value>) -> bool {
        match (self, value) {
            (FilterValue::Str(s), Some(Value::String(v))) => s == v,
            (FilterValue::Int(i), Some(v)) => v.as_i64() == Some(*i),
            (FilterValue::Bool(b), Some(Value::Bool(v))) => b == v,
            _ => false,
        }
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::Str(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::Str(value)
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        FilterValue::Int(value)
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        FilterValue::Bool(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// Related row pulled in through a foreign key (`alias:table!fk(cols)`).
#[derive(Debug, Clone, PartialEq)]
pub struct Embed {
    pub alias: String,
    pub table: String,
    pub foreign_key: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    pub columns: String,
    pub embeds: Vec<Embed>,
    pub filters: Vec<(String, FilterValue)>,
    pub order: Option<(String, Order)>,
}

impl Query {
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            columns: "*".to_string(),
            embeds: Vec::new(),
            filters: Vec::new(),
            order: None,
        }
    }

    pub fn select(mut self, columns: &str) -> Self {
        self.columns = columns.to_string();
        self
    }

    pub fn embed(mut self, alias: &str, table: &str, foreign_key: &str, columns: &[&str]) -> Self {
        self.embeds.push(Embed {
            alias: alias.to_string(),
            table: table.to_string(),
            foreign_key: foreign_key.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn eq(mut self, column: &str, value: impl Into<FilterValue>) -> Self {
        self.filters.push((column.to_string(), value.into()));
        self
    }

    pub fn order(mut self, column: &str, order: Order) -> Self {
        self.order = Some((column.to_string(), order));
        self
    }

    /// `select` parameter, embeds included.
    pub fn select_clause(&self) -> String {
        let mut clause = self.columns.clone();
        for embed in &self.embeds {
            clause.push_str(&format!(
                ",{}:{}!{}({})",
                embed.alias,
                embed.table,
                embed.foreign_key,
                embed.columns.join(",")
            ));
        }
        clause
    }

    /// Row filters only, for writes.
    pub fn filter_params(&self) -> Vec<(String, String)> {
        self.filters
            .iter()
            .map(|(column, value)| (column.clone(), format!("eq.{}", value.render())))
            .collect()
    }

    /// Full parameter list for a read.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("select".to_string(), self.select_clause())];
        params.extend(self.filter_params());
        if let Some((column, order)) = &self.order {
            let dir = match order {
                Order::Asc => "asc",
                Order::Desc => "desc",
            };
            params.push(("order".to_string(), format!("{column}.{dir}")));
        }
        params
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.filters
            .iter()
            .all(|(column, value)| value.matches(row.get(column)))
    }
}

/// Rejects patches that would not change anything.
pub fn ensure_patch(patch: &Value) -> PortalResult<()> {
    let obj = patch
        .as_object()
        .ok_or_else(|| PortalError::InvalidInput("Payload must be a JSON object".to_string()))?;

    if obj.is_empty() {
        return Err(PortalError::InvalidInput("No fields provided for update".to_string()));
    }
    Ok(())
}
