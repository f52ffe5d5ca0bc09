use crate::protocol::constants::{EXECUTE_FAILED, SUCCESS_NO_INFO};

/// Per-execution accumulator for update counts and generated ids.
///
/// For a rewritten multi-values batch the server returns one OK for many
/// rows, so every per-row slot reports `SUCCESS_NO_INFO`.
#[derive(Debug, Default)]
pub struct CmdInformation {
    update_counts: Vec<i64>,
    insert_ids: Vec<i64>,
    expected_size: usize,
    rewritten: bool,
}

impl CmdInformation {
    pub fn new(expected_size: usize) -> CmdInformation {
        CmdInformation {
            update_counts: Vec::with_capacity(expected_size.min(1024)),
            insert_ids: Vec::with_capacity(expected_size.min(1024)),
            expected_size,
            rewritten: false,
        }
    }

    pub fn add_success(&mut self, update_count: i64, insert_id: i64) {
        self.update_counts.push(update_count);
        self.insert_ids.push(insert_id);
    }

    /// A result set counts as "no update count" (-1 slot).
    pub fn add_result_set_stat(&mut self) {
        self.update_counts.push(-1);
        self.insert_ids.push(0);
    }

    pub fn add_error_stat(&mut self) {
        self.update_counts.push(EXECUTE_FAILED);
        self.insert_ids.push(0);
    }

    pub fn set_rewritten(&mut self, rewritten: bool) {
        self.rewritten = rewritten;
    }

    pub fn is_rewritten(&self) -> bool {
        self.rewritten
    }

    pub fn reset(&mut self) {
        self.update_counts.clear();
        self.insert_ids.clear();
        self.rewritten = false;
    }

    pub fn first_insert_id(&self) -> i64 {
        self.insert_ids.first().copied().unwrap_or(0)
    }

    pub fn last_update_count(&self) -> i64 {
        self.update_counts.last().copied().unwrap_or(-1)
    }

    /// The JDBC batch count vector. When the batch was rewritten, per-row
    /// information is gone and every expected slot is SUCCESS_NO_INFO.
    pub fn batch_update_counts(&self) -> Vec<i64> {
        if self.rewritten {
            return vec![SUCCESS_NO_INFO; self.expected_size];
        }
        self.update_counts.clone()
    }

    /// Generated keys of the recorded inserts: each OK's insert id expanded
    /// by the row count using the session's auto_increment step.
    pub fn generated_ids(&self, auto_increment: i64) -> Vec<i64> {
        let step = auto_increment.max(1);
        let mut ids = Vec::new();
        for (count, insert_id) in self.update_counts.iter().zip(self.insert_ids.iter()) {
            if *insert_id <= 0 {
                continue;
            }
            let rows = (*count).max(1);
            for k in 0..rows {
                ids.push(insert_id + k * step);
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn test_plain_counts() {
        let mut info = CmdInformation::new(3);
        info.add_success(1, 10);
        info.add_success(2, 11);
        info.add_error_stat();
        assert_eq!(info.batch_update_counts(), vec![1, 2, EXECUTE_FAILED]);
        assert_eq!(info.first_insert_id(), 10);
    }

    #[test]
    pub fn test_rewritten_counts_collapse() {
        let mut info = CmdInformation::new(4);
        info.add_success(4, 0);
        info.set_rewritten(true);
        assert_eq!(info.batch_update_counts(), vec![SUCCESS_NO_INFO; 4]);
    }
}
