//! Aggregate expressions for `annotate` and `aggregate`.

/// SQL aggregate function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Max,
    Min,
}

impl AggregateFunc {
    pub fn sql_name(self) -> &'static str {
        match self {
            AggregateFunc::Count => "COUNT",
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Avg => "AVG",
            AggregateFunc::Max => "MAX",
            AggregateFunc::Min => "MIN",
        }
    }

    fn default_suffix(self) -> &'static str {
        match self {
            AggregateFunc::Count => "count",
            AggregateFunc::Sum => "sum",
            AggregateFunc::Avg => "avg",
            AggregateFunc::Max => "max",
            AggregateFunc::Min => "min",
        }
    }
}

/// `FUNC([DISTINCT] field_path)`. A path of `*` counts rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub func: AggregateFunc,
    pub path: String,
    pub distinct: bool,
}

impl Aggregate {
    fn of(func: AggregateFunc, path: &str) -> Self {
        Self {
            func,
            path: path.to_string(),
            distinct: false,
        }
    }

    pub fn count(path: &str) -> Self {
        Self::of(AggregateFunc::Count, path)
    }

    pub fn sum(path: &str) -> Self {
        Self::of(AggregateFunc::Sum, path)
    }

    pub fn avg(path: &str) -> Self {
        Self::of(AggregateFunc::Avg, path)
    }

    pub fn max(path: &str) -> Self {
        Self::of(AggregateFunc::Max, path)
    }

    pub fn min(path: &str) -> Self {
        Self::of(AggregateFunc::Min, path)
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn is_star(&self) -> bool {
        self.path == "*"
    }

    /// Alias used when the caller supplies none: `view_count__sum`.
    pub fn default_alias(&self) -> String {
        let field = if self.is_star() { "all" } else { &self.path };
        format!("{}__{}", field, self.func.default_suffix())
    }
}
