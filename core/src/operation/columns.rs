/// How an identity column takes part in the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColumnDirection {
    /// Server generated, neither sent nor read back.
    #[default]
    None,
    /// Explicit values are sent with the insert.
    Input,
    /// Generated values are captured and written back onto the records.
    Output,
    InputOutput,
}

impl ColumnDirection {
    pub fn is_input(self) -> bool {
        matches!(self, ColumnDirection::Input | ColumnDirection::InputOutput)
    }

    pub fn is_output(self) -> bool {
        matches!(self, ColumnDirection::Output | ColumnDirection::InputOutput)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityColumn {
    /// Source (record field) name.
    pub name: String,
    pub direction: ColumnDirection,
}

/// One column of the match key, with an optional collation for the join equality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchColumn {
    pub name: String,
    pub collation: Option<String>,
}

/// The columns selected for an operation, in selection order.
///
/// Names are unique case-insensitively and are source (record field) names. A column may be
/// mapped onto a differently named destination column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnSet {
    columns: Vec<String>,
    mappings: Vec<(String, String)>,
}

impl ColumnSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Returns `false` when the column was already selected.
    pub fn add(&mut self, name: &str) -> bool {
        if self.contains(name) {
            return false;
        }
        self.columns.push(name.to_string());
        true
    }

    pub fn remove(&mut self, name: &str) -> bool {
        match self.position(name) {
            Some(index) => {
                self.columns.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Maps a source name onto a destination column. A later mapping for the same source wins.
    pub fn map(&mut self, source: &str, destination: &str) {
        self.mappings.retain(|(s, _)| !s.eq_ignore_ascii_case(source));
        self.mappings.push((source.to_string(), destination.to_string()));
    }

    /// The selected spelling of a column name, `None` when it is not selected.
    pub fn canonical(&self, name: &str) -> Option<&str> {
        self.position(name).map(|index| self.columns[index].as_str())
    }

    /// Destination column for a selected source name.
    pub fn destination(&self, name: &str) -> Option<&str> {
        let source = self.canonical(name)?;
        let mapped = self
            .mappings
            .iter()
            .find(|(s, _)| s.eq_ignore_ascii_case(source))
            .map(|(_, destination)| destination.as_str());

        Some(mapped.unwrap_or(source))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// `(source, destination)` for every selected column, in selection order.
    pub fn pairs(&self) -> Vec<(&str, &str)> {
        self.columns
            .iter()
            .map(|source| (source.as_str(), self.destination(source).unwrap_or(source)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}
