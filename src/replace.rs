//! Crash-safe replacement of a destination file
//!
//! The destination is never left half-written: reconstructed bytes go to a
//! scratch path first, then the swap is three renames-or-deletes, each step
//! recorded in the transaction before the next is attempted. `revert` reads
//! that record and takes the narrowest safe corrective action; in the one
//! ambiguous state (previous moved aside, new not yet in place) it warns and
//! leaves both copies on disk rather than risk destroying the only good one.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::{Result, SyncError};

/// Working state of one in-flight destination swap.
#[derive(Debug)]
pub struct ReplaceTransaction {
    destination: PathBuf,
    incoming: PathBuf,
    displaced: PathBuf,
    previous_moved: bool,
    new_moved_in: bool,
    previous_deleted: bool,
    validation_started: bool,
}

impl ReplaceTransaction {
    /// Start a replacement of `destination`. Reserves two numbered scratch
    /// paths next to it; the caller writes the new content to
    /// [`incoming_path`](Self::incoming_path) and then calls
    /// [`commit`](Self::commit).
    pub fn begin(destination: &Path) -> Result<Self> {
        let incoming = reserve_temp_path(destination)?;
        let displaced = reserve_temp_path(destination)?;
        debug!(
            dest = %destination.display(),
            incoming = %incoming.display(),
            "replace transaction started"
        );
        Ok(Self {
            destination: destination.to_path_buf(),
            incoming,
            displaced,
            previous_moved: false,
            new_moved_in: false,
            previous_deleted: false,
            validation_started: false,
        })
    }

    /// Where the caller writes the reconstructed bytes.
    pub fn incoming_path(&self) -> &Path {
        &self.incoming
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Swap the new content into place: move any previous content aside,
    /// move the new content onto the final name, drop the previous content.
    /// Renames on one volume are effectively atomic, so no step leaves the
    /// destination truncated.
    pub fn commit(&mut self) -> Result<()> {
        self.move_previous_aside()?;
        self.move_new_into_place()?;
        self.discard_previous()?;
        Ok(())
    }

    /// Record that post-commit validation of the destination has begun, so a
    /// later revert knows the swap itself finished.
    pub fn mark_validation_started(&mut self) {
        self.validation_started = true;
    }

    fn move_previous_aside(&mut self) -> Result<()> {
        if self.destination.exists() {
            fs::rename(&self.destination, &self.displaced)?;
            self.previous_moved = true;
        } else {
            // The reserved placeholder will never be renamed over.
            let _ = fs::remove_file(&self.displaced);
        }
        Ok(())
    }

    fn move_new_into_place(&mut self) -> Result<()> {
        fs::rename(&self.incoming, &self.destination)?;
        self.new_moved_in = true;
        Ok(())
    }

    fn discard_previous(&mut self) -> Result<()> {
        if self.previous_moved {
            fs::remove_file(&self.displaced)?;
            self.previous_deleted = true;
        }
        Ok(())
    }

    /// Best-effort rollback after a failure; inspects how far the commit got
    /// and never returns an error itself.
    pub fn revert(&mut self, cause: &SyncError) {
        warn!(
            dest = %self.destination.display(),
            previous_moved = self.previous_moved,
            new_moved_in = self.new_moved_in,
            previous_deleted = self.previous_deleted,
            validation_started = self.validation_started,
            %cause,
            "reverting replace transaction"
        );

        if !self.previous_moved && !self.new_moved_in {
            // Nothing touched the destination; drop the orphan scratch files.
            let _ = fs::remove_file(&self.incoming);
            let _ = fs::remove_file(&self.displaced);
            return;
        }

        if self.previous_moved && !self.new_moved_in {
            // Ambiguous: the rename onto the destination may or may not have
            // landed before failing. Acting here could destroy the only
            // remaining good copy, so leave both for manual cleanup.
            warn!(
                previous = %self.displaced.display(),
                new = %self.incoming.display(),
                "swap is ambiguous; previous and new content left on disk for manual cleanup"
            );
            return;
        }

        if self.new_moved_in && self.previous_moved && !self.previous_deleted {
            // New content is committed, previous still parked next to it.
            warn!(
                previous = %self.displaced.display(),
                "destination holds the new content; previous copy left at its scratch path"
            );
            return;
        }

        // Fully committed (and possibly failed during validation): the
        // previous content is gone, the destination holds the new bytes.
        warn!(
            dest = %self.destination.display(),
            "destination holds the new content and no previous copy remains"
        );
    }
}

/// Reserve `<dest>.tmp_tN`, probing N upward past files already on disk so
/// concurrent transactions for the same destination never collide.
fn reserve_temp_path(destination: &Path) -> Result<PathBuf> {
    let file_name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dest".to_string());
    let dir = destination.parent().unwrap_or_else(|| Path::new("."));

    for n in 0u32.. {
        let candidate = dir.join(format!("{file_name}.tmp_t{n}"));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("u32 temp suffixes exhausted");
}
