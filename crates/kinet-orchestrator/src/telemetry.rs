//! Telemetry file tailing
//!
//! The network simulator appends one `"x,y"` line per sample to a per-vehicle
//! file. Only the last line matters; files grow for hours, so the reader
//! seeks to the end and scans backward instead of reading the whole file.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use kinet_core::{Point, VehicleId};

const TAIL_CHUNK: usize = 256;

/// Path of the telemetry file for one vehicle
pub fn telemetry_path(dir: &Path, vehicle: VehicleId) -> PathBuf {
    dir.join(format!("position-car{vehicle}-mn-telemetry.txt"))
}

/// Last non-empty line of a file, or `None` when the file is missing or
/// empty. Errors are treated as "no sample yet": the simulator may not have
/// created the file.
pub fn read_last_line(path: &Path) -> Option<String> {
    let mut file = File::open(path).ok()?;
    let len = file.seek(SeekFrom::End(0)).ok()?;
    if len == 0 {
        return None;
    }

    let mut buf: Vec<u8> = Vec::new();
    let mut pos = len;

    // Read backward in chunks until a newline precedes the collected tail
    while pos > 0 {
        let chunk = TAIL_CHUNK.min(pos as usize);
        pos -= chunk as u64;
        file.seek(SeekFrom::Start(pos)).ok()?;
        let mut chunk_buf = vec![0u8; chunk];
        file.read_exact(&mut chunk_buf).ok()?;
        chunk_buf.extend_from_slice(&buf);
        buf = chunk_buf;

        if let Some(tail) = trailing_line(&buf) {
            if buf[..buf.len() - tail.len()].contains(&b'\n') {
                break;
            }
        }
    }

    trailing_line(&buf).map(|s| s.to_string())
}

/// Last non-empty line of a byte buffer
fn trailing_line(buf: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(buf).ok()?;
    text.lines().rev().find(|l| !l.trim().is_empty())
}

/// Parse a `"x,y"` telemetry line
pub fn parse_position(line: &str) -> Option<Point> {
    let mut parts = line.split(',');
    let x = parts.next()?.trim().parse::<f64>().ok()?;
    let y = parts.next()?.trim().parse::<f64>().ok()?;
    Some(Point::new(x, y))
}
