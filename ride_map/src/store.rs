//! Hazard point storage.
//!
//! Stores are append-only sequences of points plus the raw sample history
//! they were computed from. Queries are lazy and may be restarted by calling
//! [`HazardStore::query`] again; result order is unspecified.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::filter::RangeFilter;
use crate::sample::Sample;
use crate::window::HazardPoint;
use crate::RmError;

pub type PointIter<'a> = Box<dyn Iterator<Item = HazardPoint> + Send + 'a>;

pub trait HazardStore: Send + Sync {
    fn put(&self, point: HazardPoint) -> Result<(), RmError>;

    fn query(&self, filter: &RangeFilter) -> Result<PointIter<'_>, RmError>;

    fn append_samples(&self, samples: &[Sample]) -> Result<(), RmError>;

    fn session_samples(&self, session_id: &str) -> Result<Vec<Sample>, RmError>;

    /// Validate every point before writing any of them.
    fn put_all(&self, points: &[HazardPoint]) -> Result<usize, RmError> {
        for point in points {
            point.validate()?;
        }
        for point in points {
            self.put(point.clone())?;
        }
        Ok(points.len())
    }
}

/// In-process store. Queries iterate a snapshot taken when the query starts,
/// so concurrent writes never block or disturb a running query.
#[derive(Debug, Default)]
pub struct MemoryStore {
    points: RwLock<Arc<Vec<HazardPoint>>>,
    samples: RwLock<Vec<Sample>>,
}

fn poisoned<T>(_: PoisonError<T>) -> RmError {
    RmError::unavailable("memory store lock poisoned")
}

impl MemoryStore {
    pub fn len(&self) -> usize {
        self.points.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HazardStore for MemoryStore {
    fn put(&self, point: HazardPoint) -> Result<(), RmError> {
        point.validate()?;
        let mut guard = self.points.write().map_err(poisoned)?;
        Arc::make_mut(&mut guard).push(point);
        Ok(())
    }

    fn query(&self, filter: &RangeFilter) -> Result<PointIter<'_>, RmError> {
        let snapshot = Arc::clone(&*self.points.read().map_err(poisoned)?);
        let filter = filter.clone();
        Ok(Box::new((0..snapshot.len()).filter_map(move |i| {
            let point = &snapshot[i];
            filter.matches(point).then(|| point.clone())
        })))
    }

    fn append_samples(&self, samples: &[Sample]) -> Result<(), RmError> {
        let mut guard = self.samples.write().map_err(poisoned)?;
        guard.extend_from_slice(samples);
        Ok(())
    }

    fn session_samples(&self, session_id: &str) -> Result<Vec<Sample>, RmError> {
        let guard = self.samples.read().map_err(poisoned)?;
        Ok(guard
            .iter()
            .filter(|s| s.session_id == session_id)
            .cloned()
            .collect())
    }
}

/// Directory-backed store: one JSON document per line in `points.jsonl` and
/// `samples.jsonl`.
#[derive(Debug)]
pub struct JsonlStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

const POINTS_FILE: &str = "points.jsonl";
const SAMPLES_FILE: &str = "samples.jsonl";

impl JsonlStore {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, RmError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| {
            RmError::unavailable(format!("cannot create {}: {e}", root.display()))
        })?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn append_lines<T: Serialize>(&self, file: &str, items: &[T]) -> Result<(), RmError> {
        let mut buf = String::new();
        for item in items {
            let line = serde_json::to_string(item)
                .map_err(|e| RmError::invalid(format!("cannot serialize record: {e}")))?;
            buf.push_str(&line);
            buf.push('\n');
        }
        let path = self.root.join(file);
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| RmError::unavailable(format!("cannot open {}: {e}", path.display())))?;
        handle
            .write_all(buf.as_bytes())
            .map_err(|e| RmError::unavailable(format!("cannot write {}: {e}", path.display())))
    }

    fn read_lines<T: DeserializeOwned + 'static>(
        &self,
        file: &str,
    ) -> Result<Box<dyn Iterator<Item = T> + Send>, RmError> {
        if !self.root.is_dir() {
            return Err(RmError::unavailable(format!(
                "store directory {} is missing",
                self.root.display()
            )));
        }
        let path = self.root.join(file);
        let handle = match File::open(&path) {
            Ok(handle) => handle,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Box::new(std::iter::empty())),
            Err(e) => {
                return Err(RmError::unavailable(format!(
                    "cannot open {}: {e}",
                    path.display()
                )))
            }
        };
        Ok(Box::new(BufReader::new(handle).lines().enumerate().filter_map(
            move |(index, line)| {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(path = %path.display(), line = index + 1, error = %err, "unreadable line");
                        return None;
                    }
                };
                if line.trim().is_empty() {
                    return None;
                }
                match serde_json::from_str(&line) {
                    Ok(item) => Some(item),
                    Err(err) => {
                        warn!(path = %path.display(), line = index + 1, error = %err, "skipping malformed record");
                        None
                    }
                }
            },
        )))
    }
}

impl HazardStore for JsonlStore {
    fn put(&self, point: HazardPoint) -> Result<(), RmError> {
        point.validate()?;
        self.append_lines(POINTS_FILE, std::slice::from_ref(&point))
    }

    fn put_all(&self, points: &[HazardPoint]) -> Result<usize, RmError> {
        for point in points {
            point.validate()?;
        }
        self.append_lines(POINTS_FILE, points)?;
        Ok(points.len())
    }

    fn query(&self, filter: &RangeFilter) -> Result<PointIter<'_>, RmError> {
        let filter = filter.clone();
        let points = self.read_lines::<HazardPoint>(POINTS_FILE)?;
        Ok(Box::new(points.filter(move |p| filter.matches(p))))
    }

    fn append_samples(&self, samples: &[Sample]) -> Result<(), RmError> {
        self.append_lines(SAMPLES_FILE, samples)
    }

    fn session_samples(&self, session_id: &str) -> Result<Vec<Sample>, RmError> {
        Ok(self
            .read_lines::<Sample>(SAMPLES_FILE)?
            .filter(|s| s.session_id == session_id)
            .collect())
    }
}
