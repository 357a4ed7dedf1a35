// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Board support lookup.
//!
//! The DMI board name identifies the laptop model. Boards in [`SUPPORTED_BOARDS`]
//! are known to work with the patched driver; [`POSSIBLY_SUPPORTED_BOARDS`]
//! lists boards community reports place on the Omen thermal path.

use crate::config::{Config, ConfigStore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

/// DMI board name file.
pub const BOARD_NAME_PATH: &str = "/sys/class/dmi/id/board_name";

pub const SUPPORTED_BOARDS: &[&str] = &[
    "84DA", "84DB", "84DC", "8572", "8573", "8574", "8575", "8600", "8601", "8602", "8603",
    "8604", "8605", "8606", "8607", "860A", "8746", "8747", "8748", "8749", "874A", "8786",
    "8787", "8788", "878A", "878B", "878C", "87B5", "886B", "886C", "88C8", "88CB", "88D1",
    "88D2", "88F4", "88F5", "88F6", "88F7", "88FD", "88FE", "88FF", "8900", "8901", "8902",
    "8912", "8917", "8918", "8949", "894A", "89EB", "8A15", "8A42", "8BAD", "8A25", "8BBE",
    "8BD4", "8BD5", "8C78", "8C99", "8C9C", "8D41",
];

pub const POSSIBLY_SUPPORTED_BOARDS: &[&str] = &[
    "84DA", "84DB", "84DC", "8574", "8575", "860A", "87B5", "8572", "8573", "8600", "8601",
    "8602", "8605", "8606", "8607", "8746", "8747", "8749", "874A", "8603", "8604", "8748",
    "886B", "886C", "878A", "878B", "878C", "88C8", "88CB", "8786", "8787", "8788", "88D1",
    "88D2", "88F4", "88FD", "88F5", "88F6", "8A13", "8A14", "8A15", "8A16", "88F7", "88FE",
    "8A17", "8A18", "8A19", "8A1A", "8BAD", "8BB0", "88FF", "8900", "8901", "8902", "8912",
    "8917", "8918", "8A97", "8A96", "8D2C", "8949", "8A98", "894A", "8B1D", "89EB", "8A4C",
    "8A4D", "8A4E", "8A40", "8A41", "8A42", "8A43", "8A44", "8BA8", "8BA9", "8BAA", "8BAB",
    "8BAC", "8C76", "8C77", "8C78", "8BCA", "8BCB", "8BCD", "8BCF", "8C9B", "8BB3", "8BB4",
    "8C4D", "8C4E", "8C58", "8C75", "8C74", "8C73", "8CC1", "8CC0", "8CF1", "8CF2", "8CF3",
    "8CF4",
];

/// Board name reported when DMI cannot be read.
pub const UNKNOWN_BOARD: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BoardSupport {
    Supported,
    PossiblySupported,
    Unsupported,
}

impl fmt::Display for BoardSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BoardSupport::Supported => "SUPPORTED",
            BoardSupport::PossiblySupported => "POSSIBLY_SUPPORTED",
            BoardSupport::Unsupported => "UNSUPPORTED",
        })
    }
}

/// Classify a board id. `supported` wins over `possibly`.
pub fn classify(board_id: &str, supported: &[&str], possibly: &[&str]) -> BoardSupport {
    if supported.contains(&board_id) {
        BoardSupport::Supported
    } else if possibly.contains(&board_id) {
        BoardSupport::PossiblySupported
    } else {
        BoardSupport::Unsupported
    }
}

/// Classify against the built-in tables.
pub fn classify_builtin(board_id: &str) -> BoardSupport {
    classify(board_id, SUPPORTED_BOARDS, POSSIBLY_SUPPORTED_BOARDS)
}

/// Read the DMI board name.
pub fn read_board_name(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(s) => Some(s.trim().to_string()),
        Err(e) => {
            log::warn!("Error reading board name from {}: {e}", path.display());
            None
        }
    }
}

/// Look up this machine's board support.
///
/// Uses `cached_board_name` when present; otherwise reads `dmi_path` and
/// stores the result in the config so later runs skip the privileged read.
/// Returns the classification and the board name (or [`UNKNOWN_BOARD`]).
pub fn check_board_support(
    config: &mut Config,
    store: &ConfigStore,
    dmi_path: &Path,
) -> (BoardSupport, String) {
    let board = match config.cached_board_name.clone() {
        Some(name) => name,
        None => {
            let Some(name) = read_board_name(dmi_path) else {
                return (BoardSupport::Unsupported, UNKNOWN_BOARD.to_string());
            };
            config.cached_board_name = Some(name.clone());
            if let Err(e) = store.update(|c| c.cached_board_name = Some(name.clone())) {
                log::warn!("Could not cache board name: {e}");
            }
            name
        }
    };

    (classify_builtin(&board), board)
}
