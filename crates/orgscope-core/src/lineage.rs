use std::collections::{BTreeSet, VecDeque};

use crate::{MappingId, MappingStatus, MappingVersion, OrgError};

/// Upper bound on nodes visited while resolving one lineage.
pub const MAX_LINEAGE_STEPS: usize = 10_000;

/// Read access to the parent/child links between mapping versions.
pub trait LineageSource {
    type Error: From<OrgError>;

    /// `Ok(None)` when `id` does not exist, otherwise its parent pointer.
    ///
    /// # Errors
    /// Returns the source's error when the lookup itself fails.
    fn parent_of(&mut self, id: MappingId) -> Result<Option<Option<MappingId>>, Self::Error>;

    /// # Errors
    /// Returns the source's error when the lookup itself fails.
    fn children_of(&mut self, id: MappingId) -> Result<Vec<MappingId>, Self::Error>;
}

/// Collect every version linked to `start`: walk parent pointers to the root, then
/// gather all descendants of that root breadth-first. The root comes first.
///
/// # Errors
/// Returns [`OrgError::NotFound`] when `start` does not exist and
/// [`OrgError::System`] when a cycle, a dangling parent pointer, or more than
/// [`MAX_LINEAGE_STEPS`] nodes are encountered.
pub fn resolve_lineage<S: LineageSource>(
    source: &mut S,
    start: MappingId,
) -> Result<Vec<MappingId>, S::Error> {
    let mut visited = BTreeSet::new();
    let mut current = start;
    let root = loop {
        if !visited.insert(current) {
            return Err(OrgError::System(format!("mapping lineage cycle detected at {current}")).into());
        }
        if visited.len() > MAX_LINEAGE_STEPS {
            return Err(OrgError::System(format!(
                "mapping lineage of {start} exceeds {MAX_LINEAGE_STEPS} versions"
            ))
            .into());
        }
        match source.parent_of(current)? {
            None if current == start => {
                return Err(OrgError::NotFound(format!("mapping version {start}")).into());
            }
            None => {
                return Err(OrgError::System(format!(
                    "mapping version {current} referenced as parent does not exist"
                ))
                .into());
            }
            Some(None) => break current,
            Some(Some(parent)) => current = parent,
        }
    };

    let mut members = vec![root];
    let mut seen = BTreeSet::from([root]);
    let mut queue = VecDeque::from([root]);
    while let Some(node) = queue.pop_front() {
        for child in source.children_of(node)? {
            if !seen.insert(child) {
                return Err(
                    OrgError::System(format!("mapping lineage cycle detected at {child}")).into()
                );
            }
            if seen.len() > MAX_LINEAGE_STEPS {
                return Err(OrgError::System(format!(
                    "mapping lineage of {start} exceeds {MAX_LINEAGE_STEPS} versions"
                ))
                .into());
            }
            members.push(child);
            queue.push_back(child);
        }
    }

    Ok(members)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalPlan {
    pub approve: MappingId,
    pub deprecate: Vec<MappingId>,
}

/// Plan the approval of `target`: every other approved member gets deprecated.
///
/// # Errors
/// Returns [`OrgError::NotFound`] when `target` is not in `lineage` and
/// [`OrgError::Validation`] when it is not a draft.
pub fn approval_plan(lineage: &[MappingVersion], target: MappingId) -> Result<ApprovalPlan, OrgError> {
    let member = lineage
        .iter()
        .find(|member| member.mapping_id == target)
        .ok_or_else(|| OrgError::NotFound(format!("mapping version {target}")))?;
    if member.status != MappingStatus::Draft {
        return Err(OrgError::Validation(format!(
            "only draft versions can be approved; version {} is {}",
            member.version,
            member.status.as_str()
        )));
    }

    let deprecate = lineage
        .iter()
        .filter(|member| member.mapping_id != target && member.status == MappingStatus::Approved)
        .map(|member| member.mapping_id)
        .collect();
    Ok(ApprovalPlan { approve: target, deprecate })
}

#[derive(Debug, Clone, PartialEq)]
pub struct RevertPlan<'a> {
    /// Historical version whose content is copied.
    pub source: &'a MappingVersion,
    /// Current head the new draft is linked under.
    pub head: &'a MappingVersion,
    pub next_version: u32,
}

/// Plan a revert to `target_version`. When sibling forks share a version number the
/// most recently created holder is the source.
///
/// # Errors
/// Returns [`OrgError::NotFound`] when no member carries `target_version`.
pub fn revert_plan(lineage: &[MappingVersion], target_version: u32) -> Result<RevertPlan<'_>, OrgError> {
    let source = lineage
        .iter()
        .filter(|member| member.version == target_version)
        .max_by(|lhs, rhs| {
            (lhs.created_at, lhs.mapping_id).cmp(&(rhs.created_at, rhs.mapping_id))
        })
        .ok_or_else(|| {
            OrgError::NotFound(format!("version {target_version} is not in this lineage"))
        })?;
    let head = lineage
        .iter()
        .max_by(|lhs, rhs| {
            (lhs.version, lhs.created_at, lhs.mapping_id).cmp(&(
                rhs.version,
                rhs.created_at,
                rhs.mapping_id,
            ))
        })
        .unwrap_or(source);
    let next_version = head
        .version
        .checked_add(1)
        .ok_or_else(|| OrgError::Validation("mapping version counter overflow".to_string()))?;

    Ok(RevertPlan { source, head, next_version })
}

/// Order a lineage newest version first.
pub fn sort_history(lineage: &mut [MappingVersion]) {
    lineage.sort_by(|lhs, rhs| {
        rhs.version
            .cmp(&lhs.version)
            .then_with(|| rhs.created_at.cmp(&lhs.created_at))
            .then_with(|| rhs.mapping_id.cmp(&lhs.mapping_id))
    });
}

/// # Errors
/// Returns [`OrgError::Validation`] when the version is already deprecated.
pub fn ensure_deprecatable(version: &MappingVersion) -> Result<(), OrgError> {
    if version.status == MappingStatus::Deprecated {
        return Err(OrgError::Validation(format!(
            "version {} is already deprecated",
            version.version
        )));
    }
    Ok(())
}

/// # Errors
/// Returns [`OrgError::Validation`] unless the version is a draft without children.
pub fn ensure_deletable(version: &MappingVersion, child_count: usize) -> Result<(), OrgError> {
    if version.status != MappingStatus::Draft {
        return Err(OrgError::Validation(format!(
            "only draft versions can be deleted; version {} is {}",
            version.version,
            version.status.as_str()
        )));
    }
    if child_count > 0 {
        return Err(OrgError::Validation(format!(
            "version {} has {child_count} child versions and cannot be deleted",
            version.version
        )));
    }
    Ok(())
}
