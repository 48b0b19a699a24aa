//! Access to the managed process's append-only log file
//!
//! The same tail helper feeds startup-failure classification, detailed
//! health reports and the `logs` command.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

/// Poll interval while following the log file
const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Last `count` lines of the file. A missing file is an empty tail, not
/// an error, since the process may simply never have been started.
pub fn tail_lines(path: &Path, count: usize) -> Vec<String> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(_) => return Vec::new(),
    };

    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .map(|line| line.trim_end().to_string())
        .collect();

    let skip = lines.len().saturating_sub(count);
    lines[skip..].to_vec()
}

/// Print the last `lines` lines, then stream appended output until the
/// operator interrupts the process.
pub async fn follow(path: &Path, lines: usize) -> std::io::Result<()> {
    for line in tail_lines(path, lines) {
        println!("{line}");
    }

    let mut file = File::open(path)?;
    file.seek(SeekFrom::End(0))?;
    let mut pending = String::new();

    loop {
        let mut chunk = String::new();
        file.read_to_string(&mut chunk)?;
        if chunk.is_empty() {
            tokio::time::sleep(FOLLOW_POLL_INTERVAL).await;
            continue;
        }

        pending.push_str(&chunk);
        while let Some(newline) = pending.find('\n') {
            let line: String = pending.drain(..=newline).collect();
            println!("{}", line.trim_end());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_tail_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(tail_lines(&dir.path().join("absent.log"), 10).is_empty());
    }

    #[test]
    fn test_tail_returns_last_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caddy.log");
        let mut file = File::create(&path).unwrap();
        for i in 0..20 {
            writeln!(file, "line {i}").unwrap();
        }

        let tail = tail_lines(&path, 3);
        assert_eq!(tail, vec!["line 17", "line 18", "line 19"]);
    }

    #[test]
    fn test_tail_shorter_file_than_requested() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caddy.log");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "only line").unwrap();

        assert_eq!(tail_lines(&path, 50), vec!["only line"]);
    }
}
