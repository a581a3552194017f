//! Route panics into the log.

use chrono::Local;
use std::{
    backtrace::Backtrace,
    fs::OpenOptions,
    io::Write,
    panic::{PanicHookInfo, take_hook},
    path::{Path, PathBuf},
    thread,
};

use crate::logging::LOG_FILE_PREFIX;

/// Install a global panic hook that logs through `tracing` and appends the
/// record straight to today's log file in `log_dir`.
///
/// The direct append keeps panics from worker threads on disk even if the
/// non-blocking writer is torn down before it flushes.
pub fn install(log_dir: impl AsRef<Path>) {
    let log_dir = log_dir.as_ref().to_path_buf();
    let previous_hook = take_hook();

    std::panic::set_hook(Box::new(move |panic_info: &PanicHookInfo<'_>| {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let record = format_panic_record(panic_info);
            tracing::error!(target: "ride_notify::panic", "{record}");
            let _ = append_panic_record(&log_dir, &record);
        }));

        previous_hook(panic_info);
    }));
}

fn append_panic_record(log_dir: &Path, record: &str) -> std::io::Result<()> {
    let filename = format!("{}.{}", LOG_FILE_PREFIX, Local::now().format("%Y-%m-%d"));
    let path = PathBuf::from(log_dir).join(filename);

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{record}")?;
    file.flush()
}

fn format_panic_record(panic_info: &PanicHookInfo<'_>) -> String {
    let payload = payload_to_string(panic_info.payload())
        .unwrap_or_else(|| panic_info.to_string());
    let location = panic_info
        .location()
        .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
        .unwrap_or_else(|| "<unknown>".to_string());
    let thread_name = thread::current()
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| "<unnamed>".to_string());
    let ts = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z");

    format!(
        "{ts} PANIC thread={thread_name} location={location} payload={payload}\nBacktrace:\n{}",
        Backtrace::capture()
    )
}

/// Text of a panic payload, when it is a string.
pub fn payload_to_string(payload: &(dyn std::any::Any + Send)) -> Option<String> {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return Some((*s).to_string());
    }
    payload.downcast_ref::<String>().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_to_string() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(payload_to_string(boxed.as_ref()).as_deref(), Some("boom"));

        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(payload_to_string(boxed.as_ref()).as_deref(), Some("bang"));

        let boxed: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(payload_to_string(boxed.as_ref()), None);
    }

    #[test]
    fn test_append_panic_record() {
        let dir = tempfile::tempdir().unwrap();
        append_panic_record(dir.path(), "PANIC test").unwrap();
        let name = format!("{}.{}", LOG_FILE_PREFIX, Local::now().format("%Y-%m-%d"));
        let written = std::fs::read_to_string(dir.path().join(name)).unwrap();
        assert!(written.contains("PANIC test"));
    }
}
