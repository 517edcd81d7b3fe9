use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::admin::{AdminError, Result};
use crate::primitives::pager::{PageStore, Pager, PagerOptions};
use crate::types::page::{is_unformatted, PAGE_HDR_LEN};

/// Opens an existing store file for offline inspection.
///
/// The page size is taken from the file and checksum verification stays on.
/// Files without a formatted first page are rejected before the pager sees them.
pub fn open_store(path: &Path) -> Result<Arc<dyn PageStore>> {
    if !path.is_file() {
        return Err(AdminError::missing_store(path));
    }
    let mut head = [0u8; PAGE_HDR_LEN];
    let formatted = match File::open(path)?.read_exact(&mut head) {
        Ok(()) => !is_unformatted(&head),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => false,
        Err(err) => return Err(err.into()),
    };
    if !formatted {
        return Err(AdminError::Message(format!(
            "{} is not a formatted store",
            path.display()
        )));
    }
    Ok(Arc::new(Pager::open(path, PagerOptions::default())?))
}
