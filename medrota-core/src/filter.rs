//! Load options for batch queries
//!
//! Options are part of the cache key, so every type here serializes
//! deterministically: plain structs with fixed field order and sorted
//! collections.

use crate::{canonical_ids, CompetencyId, ProgramId, Relation, TenantId, Timestamp, ValidationError};
use serde::{Deserialize, Serialize};

/// Inclusive time window applied to child relations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    start: Timestamp,
    end: Timestamp,
}

impl DateRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Result<Self, ValidationError> {
        if start > end {
            return Err(ValidationError::InvalidDateRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn end(&self) -> Timestamp {
        self.end
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts <= self.end
    }
}

/// Row scoping shared by every primary query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeFilter {
    pub tenant_id: Option<TenantId>,
    pub program_id: Option<ProgramId>,
}

impl ScopeFilter {
    pub fn tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            program_id: None,
        }
    }

    pub fn with_program(mut self, program_id: ProgramId) -> Self {
        self.program_id = Some(program_id);
        self
    }
}

/// Which child collections to load alongside the primary records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationSet {
    pub submissions: bool,
    pub evaluations: bool,
    pub time_records: bool,
}

impl RelationSet {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            submissions: true,
            evaluations: true,
            time_records: true,
        }
    }

    pub fn with(mut self, relation: Relation) -> Self {
        match relation {
            Relation::Submissions => self.submissions = true,
            Relation::Evaluations => self.evaluations = true,
            Relation::TimeRecords => self.time_records = true,
        }
        self
    }

    pub fn contains(&self, relation: Relation) -> bool {
        match relation {
            Relation::Submissions => self.submissions,
            Relation::Evaluations => self.evaluations,
            Relation::TimeRecords => self.time_records,
        }
    }

    /// Requested relations in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = Relation> + '_ {
        Relation::ALL.into_iter().filter(|r| self.contains(*r))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<Relation> for RelationSet {
    fn from_iter<T: IntoIterator<Item = Relation>>(iter: T) -> Self {
        iter.into_iter().fold(RelationSet::none(), RelationSet::with)
    }
}

/// Options for `load_user_progress`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressOptions {
    pub scope: ScopeFilter,
    pub relations: RelationSet,
    pub date_range: Option<DateRange>,
}

impl ProgressOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scope(mut self, scope: ScopeFilter) -> Self {
        self.scope = scope;
        self
    }

    pub fn include(mut self, relation: Relation) -> Self {
        self.relations = self.relations.with(relation);
        self
    }

    pub fn include_all(mut self) -> Self {
        self.relations = RelationSet::all();
        self
    }

    pub fn with_date_range(mut self, range: DateRange) -> Self {
        self.date_range = Some(range);
        self
    }
}

/// Options for `load_competency_analytics`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsOptions {
    pub scope: ScopeFilter,
    /// Restrict to these competencies; `None` means all.
    pub competency_ids: Option<Vec<CompetencyId>>,
}

impl AnalyticsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scope(mut self, scope: ScopeFilter) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_competencies(mut self, ids: &[CompetencyId]) -> Self {
        self.competency_ids = Some(ids.to_vec());
        self
    }

    /// Copy with the competency filter sorted and deduplicated.
    pub fn canonical(&self) -> Self {
        Self {
            scope: self.scope,
            competency_ids: self.competency_ids.as_deref().map(canonical_ids),
        }
    }
}

/// Options for `load_rotation_overviews`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationOptions {
    pub scope: ScopeFilter,
    pub include_time_records: bool,
    pub date_range: Option<DateRange>,
}

impl RotationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scope(mut self, scope: ScopeFilter) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_time_records(mut self) -> Self {
        self.include_time_records = true;
        self
    }

    pub fn with_date_range(mut self, range: DateRange) -> Self {
        self.date_range = Some(range);
        self
    }
}
