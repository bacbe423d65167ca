//! Signature database files.
//!
//! Text format, one sample per line: the protocol name followed by the
//! feature values, whitespace-separated. `#` starts a comment line. The
//! feature count is inferred from the first data line; lines that disagree
//! or fail to parse are logged and skipped.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use protospect_core::Signature;
use tracing::{debug, warn};

use crate::labels::LabelMap;

/// Reads a signature database. Returns the parsed samples; unusable lines
/// are skipped with a diagnostic.
pub fn read(path: &Path, labels: &mut LabelMap) -> Result<Vec<Signature>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open signature database {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut samples = Vec::new();
    let mut columns: Option<usize> = None;
    for (lineno, line) in reader.lines().enumerate() {
        let line = line
            .with_context(|| format!("failed to read {}:{}", path.display(), lineno + 1))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();
        let Some(name) = fields.next() else { continue };
        let values: Vec<&str> = fields.collect();

        let expected = *columns.get_or_insert(values.len());
        if values.len() != expected {
            warn!(
                "{}:{}: expected {expected} features, got {}; line skipped",
                path.display(),
                lineno + 1,
                values.len()
            );
            continue;
        }

        let mut features = Vec::with_capacity(values.len());
        let mut bad = false;
        for value in &values {
            match value.parse::<f64>() {
                Ok(v) => features.push(v),
                Err(_) => {
                    warn!(
                        "{}:{}: unparsable feature value {value:?}; line skipped",
                        path.display(),
                        lineno + 1
                    );
                    bad = true;
                    break;
                }
            }
        }
        if bad {
            continue;
        }

        let mut sign = Signature::from_features(&features);
        sign.label = labels.intern(name)?;
        samples.push(sign);
    }

    debug!("{}: read {} samples", path.display(), samples.len());
    Ok(samples)
}

/// Writes the training set out, one line per signature. Returns how many
/// lines were written.
pub fn write(path: &Path, signatures: &[Signature], labels: &LabelMap) -> Result<usize> {
    let file = File::create(path)
        .with_context(|| format!("failed to create signature database {}", path.display()))?;
    let mut out = BufWriter::new(file);

    let mut written = 0;
    for sign in signatures {
        write!(out, "{}", labels.display(sign.label))?;
        for value in sign.features() {
            write!(out, " {}", value)?;
        }
        writeln!(out)?;
        written += 1;
    }
    out.flush()?;

    debug!("{}: wrote {written} samples", path.display());
    Ok(written)
}
