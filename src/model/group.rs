//! Group model.

use super::schedule::AllocationSchedule;

/// A group of chargers sharing a supply. A group carrying a
/// `max_allocation` schedule is an *allocation group* and gets its own
/// engine loop; groups without one are purely organizational.
#[derive(Debug, Clone)]
pub struct Group {
    pub group_id: String,
    pub description: Option<String>,
    pub max_allocation: Option<AllocationSchedule>,
    /// Transient: pauses the engine loop for this group.
    pub suspended: bool,
}

impl Group {
    pub fn new(
        group_id: &str,
        description: Option<String>,
        max_allocation: Option<AllocationSchedule>,
    ) -> Self {
        Self {
            group_id: group_id.to_string(),
            description,
            max_allocation,
            suspended: false,
        }
    }

    pub fn is_allocation_group(&self) -> bool {
        self.max_allocation.is_some()
    }
}
