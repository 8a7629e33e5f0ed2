//! Loading host groups from inventory files

use std::path::Path;

use super::{is_host_line, parse_entry, push_unique, HostEntry};
use crate::error::InventoryError;

/// Load the entries of `group` from the inventory file at `path`.
///
/// Entries run from the `[group]` header to the next header. Fails with
/// [`InventoryError::GroupNotFound`] listing every group in the file when
/// the header is absent.
pub fn load_from_inventory_file(path: &Path, group: &str) -> Result<Vec<HostEntry>, InventoryError> {
    let content = std::fs::read_to_string(path).map_err(|source| InventoryError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut entries = Vec::new();
    let mut groups = Vec::new();
    let mut in_group = false;
    let mut found = false;

    for line in content.lines() {
        let line = line.trim();
        if !is_host_line(line) {
            continue;
        }
        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            groups.push(header.to_string());
            in_group = header == group && !found;
            found |= in_group;
            continue;
        }
        if in_group {
            push_unique(&mut entries, parse_entry(line));
        }
    }

    if !found {
        groups.sort();
        return Err(InventoryError::GroupNotFound {
            group: group.to_string(),
            path: path.to_path_buf(),
            available: groups,
        });
    }

    tracing::debug!(
        "Loaded {} host entries for group {} from {}",
        entries.len(),
        group,
        path.display()
    );
    Ok(entries)
}
