//! Protocol-name interning.
//!
//! The core works with opaque small-integer labels; the mapping between
//! protocol names and labels lives here. Label 1 is reserved for the
//! literal name `"unknown"`; label 0 stays unassigned and means "no
//! verdict yet".

use anyhow::{Result, bail};
use protospect_core::Label;

pub struct LabelMap {
    names: Vec<String>,
}

impl LabelMap {
    pub fn new() -> Self {
        LabelMap {
            names: vec!["unknown".to_string()],
        }
    }

    /// Returns the label of `name`, assigning the next free one on first
    /// use. Fails once the 8-bit label space is exhausted.
    pub fn intern(&mut self, name: &str) -> Result<Label> {
        if let Some(pos) = self.names.iter().position(|n| n == name) {
            return Ok((pos + 1) as Label);
        }
        if self.names.len() >= 255 {
            bail!("too many distinct protocol names (max 255)");
        }
        self.names.push(name.to_string());
        Ok(self.names.len() as Label)
    }

    pub fn name(&self, label: Label) -> Option<&str> {
        if label == 0 {
            return None;
        }
        self.names.get(label as usize - 1).map(String::as_str)
    }

    /// Printable name; unset labels read as "unknown".
    pub fn display(&self, label: Label) -> &str {
        self.name(label).unwrap_or("unknown")
    }
}
