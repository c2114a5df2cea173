use crate::errors::FixtureFarmError;
use chrono::{Duration, Local, NaiveDateTime};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Wall-clock source. Times are naive and interpreted in the recording zone.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, FixtureFarmError>;
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), FixtureFarmError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), FixtureFarmError>;
    fn remove_file(&self, path: &Path) -> Result<(), FixtureFarmError>;
    fn rename(&self, from: &Path, to: &Path) -> Result<(), FixtureFarmError>;
    fn exists(&self, path: &Path) -> bool;
}

pub trait Terminal: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), FixtureFarmError>;
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, FixtureFarmError> {
        std::fs::read_to_string(path).map_err(|e| FixtureFarmError::Io(e.to_string()))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), FixtureFarmError> {
        std::fs::write(path, contents).map_err(|e| FixtureFarmError::Io(e.to_string()))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), FixtureFarmError> {
        std::fs::create_dir_all(path).map_err(|e| FixtureFarmError::Io(e.to_string()))
    }

    fn remove_file(&self, path: &Path) -> Result<(), FixtureFarmError> {
        std::fs::remove_file(path).map_err(|e| FixtureFarmError::Io(e.to_string()))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), FixtureFarmError> {
        std::fs::rename(from, to).map_err(|e| FixtureFarmError::Io(e.to_string()))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn write_line(&self, line: &str) -> Result<(), FixtureFarmError> {
        use std::io::Write;
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| FixtureFarmError::Io(e.to_string()))
    }
}

pub struct ProductionRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub terminal: Arc<dyn Terminal>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
            terminal: Arc::new(ProductionTerminal),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<NaiveDateTime>>,
}

impl FakeClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: NaiveDateTime) {
        *lock(&self.now) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock(&self.now);
        *now += by;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> NaiveDateTime {
        *lock(&self.now)
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    dirs: Arc<Mutex<Vec<PathBuf>>>,
    fail_next: Arc<Mutex<Option<FixtureFarmError>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        lock(&fs.files).insert(path.into(), contents.into());
        fs
    }

    pub fn set_fail_next(&self, error: FixtureFarmError) {
        *lock(&self.fail_next) = Some(error);
    }

    pub fn created_dirs(&self) -> Vec<PathBuf> {
        lock(&self.dirs).clone()
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<String> {
        lock(&self.files).get(path.as_ref()).cloned()
    }

    fn maybe_fail(&self) -> Result<(), FixtureFarmError> {
        if let Some(err) = lock(&self.fail_next).take() {
            return Err(err);
        }
        Ok(())
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, FixtureFarmError> {
        self.maybe_fail()?;
        lock(&self.files)
            .get(path)
            .cloned()
            .ok_or_else(|| FixtureFarmError::Io(format!("missing file {}", path.display())))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), FixtureFarmError> {
        self.maybe_fail()?;
        lock(&self.files).insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), FixtureFarmError> {
        self.maybe_fail()?;
        lock(&self.dirs).push(path.to_path_buf());
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<(), FixtureFarmError> {
        self.maybe_fail()?;
        lock(&self.files)
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| FixtureFarmError::Io(format!("missing file {}", path.display())))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), FixtureFarmError> {
        self.maybe_fail()?;
        let mut files = lock(&self.files);
        let contents = files
            .remove(from)
            .ok_or_else(|| FixtureFarmError::Io(format!("missing file {}", from.display())))?;
        files.insert(to.to_path_buf(), contents);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        lock(&self.files).contains_key(path)
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    writes: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn written_lines(&self) -> Vec<String> {
        lock(&self.writes).clone()
    }
}

impl Terminal for FakeTerminal {
    fn write_line(&self, line: &str) -> Result<(), FixtureFarmError> {
        lock(&self.writes).push(line.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, FakeClock, FakeFileSystem, FileSystem};
    use crate::errors::FixtureFarmError;
    use chrono::{Duration, NaiveDate};
    use std::path::Path;

    #[test]
    fn fake_clock_advances() {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(10, 0, 0))
            .expect("valid time");
        let clock = FakeClock::new(start);
        clock.advance(Duration::minutes(90));
        assert_eq!(clock.now(), start + Duration::minutes(90));
    }

    #[test]
    fn fake_file_system_renames_and_fails_on_demand() {
        let fs = FakeFileSystem::with_file("/storage/ab/cd/abcd", "bytes");
        fs.rename(Path::new("/storage/ab/cd/abcd"), Path::new("/storage/us/er/user_1"))
            .expect("rename");
        assert!(!fs.exists(Path::new("/storage/ab/cd/abcd")));
        assert_eq!(fs.file("/storage/us/er/user_1").as_deref(), Some("bytes"));

        fs.set_fail_next(FixtureFarmError::Io("disk full".to_string()));
        let err = fs
            .write_string(Path::new("/x.yml"), "a: 1")
            .expect_err("injected failure");
        assert_eq!(err, FixtureFarmError::Io("disk full".to_string()));
        fs.write_string(Path::new("/x.yml"), "a: 1").expect("second write");
    }
}
