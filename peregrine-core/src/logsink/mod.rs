//! Date- and line-rotated log sink.
//!
//! [`RotatingSink`] owns the log file: records land in
//! `<dir>/YYYY_MM_DD_<name>`, a new base file is opened when the day
//! changes, and after every `split_lines` records the sink switches to
//! `<dir>/YYYY_MM_DD_<name>.<k>`. With a queue the sink drains in a
//! background thread; a full queue falls back to a direct synchronous write
//! so the hot path never blocks on the drainer.
//!
//! The sink does not format anything. The `tracing` side of the contract
//! lives in [`layer`]: a [`PlainFormat`] event formatter and a
//! [`SinkWriter`] that feeds whole formatted lines into the sink.

mod layer;

pub use layer::{PlainFormat, SinkWriter};

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{Datelike, Local};
use parking_lot::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::sync::BoundedQueue;

/// How long the drainer parks when the queue stays empty.
const DRAIN_IDLE_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct SinkState {
    file: File,
    /// Records written since the current day started.
    count: u64,
    /// Day-of-month the current base file was opened for.
    today: u32,
}

/// Process-lifetime rotating file sink.
#[derive(Debug)]
pub struct RotatingSink {
    dir: PathBuf,
    name: String,
    split_lines: u64,
    state: Mutex<SinkState>,
    queue: Option<Arc<BoundedQueue<String>>>,
}

impl RotatingSink {
    /// Open the sink for `path`.
    ///
    /// A bare file name (no directory prefix) lands in `./serverLogs/`; the
    /// directory is created if absent. `split_lines` bounds the records per
    /// file and must be positive. `queue_size >= 1` switches the sink to
    /// asynchronous draining on a background thread.
    pub fn open(path: &Path, split_lines: u64, queue_size: usize) -> CoreResult<Arc<Self>> {
        if split_lines == 0 {
            return Err(CoreError::InvalidCapacity {
                what: "split_lines",
            });
        }

        let (dir, name) = split_log_path(path);
        fs::create_dir_all(&dir)?;

        let now = Local::now();
        let file = open_log_file(&dir, &base_name(&name, now.date_naive()))?;

        let queue = if queue_size >= 1 {
            Some(Arc::new(BoundedQueue::new(queue_size)?))
        } else {
            None
        };

        let sink = Arc::new(Self {
            dir,
            name,
            split_lines,
            state: Mutex::new(SinkState {
                file,
                count: 0,
                today: now.day(),
            }),
            queue: queue.clone(),
        });

        if let Some(queue) = queue {
            spawn_drainer(Arc::clone(&sink), queue, queue_size);
        }

        Ok(sink)
    }

    /// Write one record (a full formatted line).
    ///
    /// In async mode the record is handed to the drainer; when the queue is
    /// full it is written synchronously instead so the caller never blocks
    /// behind a slow disk.
    pub fn write_record(&self, line: &str) {
        if let Some(queue) = &self.queue {
            if queue.push(line.to_owned()) {
                return;
            }
        }
        self.write_now(line);
    }

    /// Flush buffered file data to the OS.
    pub fn flush(&self) {
        let _ = self.state.lock().file.flush();
    }

    fn write_now(&self, line: &str) {
        let now = Local::now();
        let mut state = self.state.lock();

        if state.today != now.day() {
            // Day rolled over: new base file, counter starts from scratch.
            state.today = now.day();
            state.count = 0;
            self.reopen(&mut state, &base_name(&self.name, now.date_naive()));
        } else if state.count != 0 && state.count % self.split_lines == 0 {
            let split = state.count / self.split_lines;
            let name = format!("{}.{}", base_name(&self.name, now.date_naive()), split);
            self.reopen(&mut state, &name);
        }

        let _ = state.file.write_all(line.as_bytes());
        if !line.ends_with('\n') {
            let _ = state.file.write_all(b"\n");
        }
        state.count += 1;
    }

    fn reopen(&self, state: &mut SinkState, file_name: &str) {
        let _ = state.file.flush();
        if let Ok(file) = open_log_file(&self.dir, file_name) {
            state.file = file;
        }
    }
}

fn spawn_drainer(sink: Arc<RotatingSink>, queue: Arc<BoundedQueue<String>>, queue_size: usize) {
    let batch_max = usize::min(16, usize::max(1, queue_size / 10));
    // Detached: the sink is a process-lifetime singleton.
    let _ = thread::Builder::new().name("log-drain".into()).spawn(move || {
        loop {
            let Some(first) = queue.pop_timed(DRAIN_IDLE_WAIT) else {
                continue;
            };
            sink.write_now(&first);
            let mut written = 1;
            while written < batch_max {
                match queue.try_pop() {
                    Some(line) => {
                        sink.write_now(&line);
                        written += 1;
                    }
                    None => break,
                }
            }
            sink.flush();
        }
    });
}

/// Split a configured log path into directory and file stem. A path with no
/// directory prefix is placed under `./serverLogs/`.
fn split_log_path(path: &Path) -> (PathBuf, String) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "log".to_owned());
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => (dir.to_path_buf(), name),
        _ => (PathBuf::from("./serverLogs"), name),
    }
}

fn base_name(name: &str, date: chrono::NaiveDate) -> String {
    format!("{}_{}", date.format("%Y_%m_%d"), name)
}

fn open_log_file(dir: &Path, file_name: &str) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(file_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn read_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn test_bare_name_defaults_to_server_logs_dir() {
        let (dir, name) = split_log_path(Path::new("log"));
        assert_eq!(dir, PathBuf::from("./serverLogs"));
        assert_eq!(name, "log");

        let (dir, name) = split_log_path(Path::new("/var/log/peregrine/server"));
        assert_eq!(dir, PathBuf::from("/var/log/peregrine"));
        assert_eq!(name, "server");
    }

    #[test]
    fn test_zero_split_lines_is_rejected() {
        let tmp = tempdir().unwrap();
        assert!(RotatingSink::open(&tmp.path().join("log"), 0, 0).is_err());
    }

    #[test]
    fn test_records_land_in_dated_file() {
        let tmp = tempdir().unwrap();
        let sink = RotatingSink::open(&tmp.path().join("log"), 100, 0).unwrap();
        sink.write_record("hello");
        sink.write_record("world");
        sink.flush();

        let base = base_name("log", Local::now().date_naive());
        assert_eq!(read_lines(&tmp.path().join(&base)), vec!["hello", "world"]);
    }

    #[test]
    fn test_rotation_after_split_lines_records() {
        let tmp = tempdir().unwrap();
        let sink = RotatingSink::open(&tmp.path().join("log"), 3, 0).unwrap();
        for i in 0..8 {
            sink.write_record(&format!("line {i}"));
        }
        sink.flush();

        let base = base_name("log", Local::now().date_naive());
        assert_eq!(
            read_lines(&tmp.path().join(&base)),
            vec!["line 0", "line 1", "line 2"]
        );
        assert_eq!(
            read_lines(&tmp.path().join(format!("{base}.1"))),
            vec!["line 3", "line 4", "line 5"]
        );
        assert_eq!(
            read_lines(&tmp.path().join(format!("{base}.2"))),
            vec!["line 6", "line 7"]
        );
    }

    #[test]
    fn test_async_mode_drains_records() {
        let tmp = tempdir().unwrap();
        let sink = RotatingSink::open(&tmp.path().join("log"), 100, 64).unwrap();
        for i in 0..5 {
            sink.write_record(&format!("async {i}"));
        }

        let base = tmp.path().join(base_name("log", Local::now().date_naive()));
        // The drainer runs on its own schedule; poll briefly.
        for _ in 0..100 {
            if read_lines(&base).len() == 5 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(read_lines(&base).len(), 5);
    }
}
