// Process-wide read/write gate for the embedded database.
//
// Every DB transaction in every component runs inside one of these scopes:
// reads under read(), any INSERT/UPDATE/DELETE/schema change under write(),
// held for the whole duration of the connection use. The guards are RAII so
// the gate is released on every exit path, panics included. This is the only
// synchronization primitive in the system; there is no per-row locking.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub struct DbGate {
    lock: RwLock<()>,
}

impl DbGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { lock: RwLock::new(()) })
    }

    /// Acquire the shared side. Any number of readers may hold this
    /// concurrently as long as no writer holds or is waiting.
    pub fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().unwrap()
    }

    /// Acquire the exclusive side. Blocks until all current readers release.
    pub fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().unwrap()
    }
}

impl Default for DbGate {
    fn default() -> Self {
        Self { lock: RwLock::new(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_concurrent_readers_do_not_block() {
        let gate = DbGate::new();
        let (tx, rx) = mpsc::channel();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let gate = Arc::clone(&gate);
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                let _guard = gate.read();
                tx.send(()).unwrap();
                // Hold the read lock while the other readers acquire theirs
                thread::sleep(Duration::from_millis(100));
            }));
        }

        // All four readers must be inside the lock well before any could
        // have released it.
        for _ in 0..4 {
            rx.recv_timeout(Duration::from_millis(500))
                .expect("reader blocked while other readers held the gate");
        }

        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_writer_waits_for_readers() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let gate = DbGate::new();
        let reader_done = Arc::new(AtomicBool::new(false));

        let reader_gate = Arc::clone(&gate);
        let done = Arc::clone(&reader_done);
        let reader = thread::spawn(move || {
            let _guard = reader_gate.read();
            thread::sleep(Duration::from_millis(150));
            done.store(true, Ordering::SeqCst);
        });

        // Give the reader time to take the lock
        thread::sleep(Duration::from_millis(30));

        let writer_gate = Arc::clone(&gate);
        let done = Arc::clone(&reader_done);
        let writer = thread::spawn(move || {
            let _guard = writer_gate.write();
            // The reader must have finished before the writer got in
            assert!(done.load(Ordering::SeqCst));
        });

        reader.join().unwrap();
        writer.join().unwrap();
    }

    #[test]
    fn test_write_released_on_drop() {
        let gate = DbGate::new();
        {
            let _guard = gate.write();
        }
        // If the write guard leaked, this would deadlock
        let _guard = gate.read();
    }
}
