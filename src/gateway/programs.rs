use std::collections::HashMap;

use crate::domain::datastore::Datastore;
use crate::error::Result;

/// Assigns program ids sequentially within one faculty process and
/// upserts the program row on first sight. Only the gateway loop touches
/// it, so no lock.
pub struct ProgramRegistry {
    store: Datastore,
    faculty_id: i64,
    semester: String,
    by_name: HashMap<String, i64>,
    next_id: i64,
}

impl ProgramRegistry {
    pub fn new(store: Datastore, faculty_id: i64, semester: String) -> Self {
        Self { store, faculty_id, semester, by_name: HashMap::new(), next_id: 1 }
    }

    /// Id for `name`, allocating the next one on first sight.
    pub fn resolve(&mut self, name: &str) -> Result<i64> {
        if let Some(&id) = self.by_name.get(name) {
            return Ok(id);
        }

        let id = self.next_id;
        self.store.ensure_program(id, self.faculty_id, name, &self.semester)?;
        self.by_name.insert(name.to_string(), id);
        self.next_id += 1;
        Ok(id)
    }
}
