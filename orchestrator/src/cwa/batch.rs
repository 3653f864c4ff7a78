//! Partitioning of tasks into context-bounded batches.

use super::entry::EntryId;
use crate::core::error::ContextError;

/// A task and the context entries it needs in full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchTask {
    pub task: String,
    pub entry_ids: Vec<EntryId>,
}

impl BatchTask {
    pub fn new(task: impl Into<String>, entry_ids: Vec<EntryId>) -> Self {
        Self {
            task: task.into(),
            entry_ids,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub tasks: Vec<BatchTask>,
    /// Sum of the tasks' required entry counts.
    pub entry_count: usize,
}

impl Batch {
    /// Entry ids of every task, in task order.
    pub fn entry_ids(&self) -> Vec<EntryId> {
        self.tasks
            .iter()
            .flat_map(|task| task.entry_ids.iter().copied())
            .collect()
    }
}

/// Greedily pack tasks, in order, into batches whose cumulative entry count stays
/// within `max_entries_per_batch`.
///
/// A task that alone exceeds the limit is an error; it is never truncated.
pub fn create_batches(
    tasks: Vec<BatchTask>,
    max_entries_per_batch: usize,
) -> Result<Vec<Batch>, ContextError> {
    if let Some(oversized) = tasks
        .iter()
        .find(|task| task.entry_ids.len() > max_entries_per_batch)
    {
        return Err(ContextError::BatchTooLarge {
            task: oversized.task.clone(),
            required: oversized.entry_ids.len(),
            max: max_entries_per_batch,
        });
    }

    let mut batches = Vec::new();
    let mut current = Batch::default();
    for task in tasks {
        let required = task.entry_ids.len();
        if !current.tasks.is_empty() && current.entry_count + required > max_entries_per_batch {
            batches.push(std::mem::take(&mut current));
        }
        current.entry_count += required;
        current.tasks.push(task);
    }
    if !current.tasks.is_empty() {
        batches.push(current);
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(range: std::ops::Range<u64>) -> Vec<EntryId> {
        range.map(EntryId::new).collect()
    }

    #[test]
    fn packs_tasks_until_limit() {
        let tasks = vec![
            BatchTask::new("a", ids(0..3)),
            BatchTask::new("b", ids(3..5)),
            BatchTask::new("c", ids(5..9)),
            BatchTask::new("d", Vec::new()),
        ];
        let batches = create_batches(tasks, 5).expect("batches");
        let names: Vec<Vec<&str>> = batches
            .iter()
            .map(|b| b.tasks.iter().map(|t| t.task.as_str()).collect())
            .collect();
        assert_eq!(names, vec![vec!["a", "b"], vec!["c", "d"]]);
        assert_eq!(batches[0].entry_count, 5);
        assert_eq!(batches[1].entry_count, 4);
        assert!(batches.iter().all(|b| b.entry_count <= 5));
    }

    #[test]
    fn oversized_task_is_rejected() {
        let tasks = vec![
            BatchTask::new("small", ids(0..1)),
            BatchTask::new("huge", ids(0..6)),
        ];
        let err = create_batches(tasks, 5).expect_err("too large");
        assert_eq!(
            err,
            ContextError::BatchTooLarge {
                task: "huge".to_string(),
                required: 6,
                max: 5,
            }
        );
    }

    #[test]
    fn empty_input_yields_no_batches() {
        assert!(create_batches(Vec::new(), 10).expect("batches").is_empty());
    }
}
