use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::IngestError;

#[derive(Debug, Clone, Default)]
pub struct IndexLocks {
    table: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl IndexLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, name: &str) -> Result<Arc<Mutex<()>>, IngestError> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| IngestError::ObjectStore("lock table poisoned".to_string()))?;
        Ok(table
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    pub fn with_lock<T, F>(&self, name: &str, critical: F) -> Result<T, IngestError>
    where
        F: FnOnce() -> Result<T, IngestError>,
    {
        let lock = self.entry(name)?;
        let _guard = lock
            .lock()
            .map_err(|_| IngestError::ObjectStore(format!("lock {name} poisoned")))?;
        debug!(lock = name, "acquired index lock");
        critical()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn same_name_is_exclusive() {
        let locks = IndexLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    locks
                        .with_lock("index.json", || {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(2));
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
