//! Protected zones: rectangular regions immune to edits.
//!
//! The zone list is owned by an external admin collaborator and stored as a
//! JSON file; the core only reads it at startup and consults it during
//! validation. Edits that land inside a zone are dropped without any notice
//! so probing clients cannot map the zone geometry.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    #[serde(default)]
    pub reason: String,
}

impl Zone {
    /// Half-open containment: `[x, x+w) x [y, y+h)`.
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.x + self.w && y >= self.y && y < self.y + self.h
    }
}

pub fn is_protected(zones: &[Zone], x: u32, y: u32) -> bool {
    zones.iter().any(|zone| zone.contains(x, y))
}

/// Loads the zone list; a missing or malformed file means no zones.
pub fn load_zones(path: &Path) -> Vec<Zone> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => return Vec::new(),
    };
    match serde_json::from_str::<Vec<Zone>>(&text) {
        Ok(zones) => {
            info!("Loaded {} protected zones from {}", zones.len(), path.display());
            zones
        }
        Err(e) => {
            warn!("Ignoring malformed zones file {}: {}", path.display(), e);
            Vec::new()
        }
    }
}
