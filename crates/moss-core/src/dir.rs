//! Directory handles and path-level operations.
//!
//! Path resolution walks one segment at a time from the root pair with
//! repeated metadata-log lookups. Rename inside one directory is a single
//! atomic commit (new entry plus tombstone under one CRC record); across
//! directories the new entry is committed first and the old one removed
//! second, so an interruption never leaves the entry missing under both
//! names.

use moss_error::{FsError, Result};
use moss_mdlog::{EntryPayload, LogOp, MetaPair};
use moss_types::BlockPointer;
use serde::{Deserialize, Serialize};

use crate::{BlockDevice, Filesystem};

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    File,
    Directory,
}

/// What `stat` and `dir_read` report about one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub entry_type: EntryType,
    /// File size in bytes; zero for directories.
    pub size: u32,
    pub name: String,
}

/// An open directory, positioned over the live entries of its pair in log
/// order. Owned by the caller and destroyed by [`Filesystem::dir_close`].
#[derive(Debug)]
pub struct DirHandle {
    pair: [BlockPointer; 2],
    pos: usize,
}

fn entry_info(name: String, payload: &EntryPayload) -> EntryInfo {
    match payload {
        EntryPayload::File { size, .. } => EntryInfo {
            entry_type: EntryType::File,
            size: *size,
            name,
        },
        EntryPayload::Dir { .. } => EntryInfo {
            entry_type: EntryType::Directory,
            size: 0,
            name,
        },
    }
}

impl<D: BlockDevice> Filesystem<D> {
    pub(crate) fn fetch_pair(&self, blocks: [BlockPointer; 2]) -> Result<MetaPair> {
        MetaPair::fetch(&self.device, self.geometry(), blocks)
    }

    /// Walk `segments` from the root, requiring every one to be a directory.
    pub(crate) fn resolve_dir(&self, segments: &[String]) -> Result<MetaPair> {
        let mut pair = self.fetch_pair(self.root)?;
        for (depth, segment) in segments.iter().enumerate() {
            match pair.lookup(&self.device, self.geometry(), segment)? {
                Some(EntryPayload::Dir { pair: next }) => pair = self.fetch_pair(next)?,
                Some(EntryPayload::File { .. }) => return Err(FsError::NotDirectory),
                None => return Err(FsError::NotFound(format!("/{}", segments[..=depth].join("/")))),
            }
        }
        Ok(pair)
    }

    /// Resolve all but the last segment to a directory pair; returns it with
    /// the leaf name.
    pub(crate) fn resolve_parent(&self, segments: &[String]) -> Result<(MetaPair, String)> {
        let (leaf, parents) = segments
            .split_last()
            .ok_or_else(|| FsError::InvalidArgument("the root has no parent".to_owned()))?;
        Ok((self.resolve_dir(parents)?, leaf.clone()))
    }

    /// Create a directory. The child pair is written before the parent entry
    /// commits, so an interruption leaves at most an unreferenced pair that
    /// the allocator reclaims lazily.
    pub fn create_dir(&mut self, path: &str) -> Result<()> {
        let segments = crate::path::normalize(path)?;
        if segments.is_empty() {
            return Err(FsError::Exists("/".to_owned()));
        }
        let (mut parent, name) = self.resolve_parent(&segments)?;
        let geom = *self.geometry();
        if parent.lookup(&self.device, &geom, &name)?.is_some() {
            return Err(FsError::Exists(path.to_owned()));
        }

        let first = self.alloc_block(&[])?;
        let second = self.alloc_block(&[first])?;
        let child = MetaPair::create(&self.device, &geom, [first, second])?;
        parent.commit(
            &self.device,
            &geom,
            &[LogOp::Upsert {
                name: &name,
                payload: EntryPayload::Dir {
                    pair: child.blocks(),
                },
            }],
        )
    }

    /// Remove a file or an empty directory. The blocks behind the entry are
    /// reclaimed lazily by the next allocator rescan.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let segments = crate::path::normalize(path)?;
        if segments.is_empty() {
            return Err(FsError::InvalidArgument(
                "cannot remove the root directory".to_owned(),
            ));
        }
        let (mut parent, name) = self.resolve_parent(&segments)?;
        let geom = *self.geometry();
        match parent.lookup(&self.device, &geom, &name)? {
            None => return Err(FsError::NotFound(path.to_owned())),
            Some(EntryPayload::Dir { pair }) => {
                let child = self.fetch_pair(pair)?;
                if !child.is_empty(&self.device, &geom)? {
                    return Err(FsError::NotEmpty);
                }
            }
            Some(EntryPayload::File { .. }) => {}
        }
        parent.commit(&self.device, &geom, &[LogOp::Remove { name: &name }])
    }

    /// Rename `old` to `new`, replacing an existing target of the same type
    /// (an existing directory target must be empty).
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let old_segments = crate::path::normalize(old)?;
        let new_segments = crate::path::normalize(new)?;
        if old_segments.is_empty() || new_segments.is_empty() {
            return Err(FsError::InvalidArgument(
                "cannot rename the root directory".to_owned(),
            ));
        }
        if old_segments == new_segments {
            return Ok(());
        }

        let geom = *self.geometry();
        let (mut old_parent, old_name) = self.resolve_parent(&old_segments)?;
        let payload = old_parent
            .lookup(&self.device, &geom, &old_name)?
            .ok_or_else(|| FsError::NotFound(old.to_owned()))?;

        if matches!(payload, EntryPayload::Dir { .. })
            && new_segments.len() > old_segments.len()
            && new_segments[..old_segments.len()] == old_segments[..]
        {
            return Err(FsError::InvalidArgument(
                "cannot move a directory into itself".to_owned(),
            ));
        }

        let (mut new_parent, new_name) = self.resolve_parent(&new_segments)?;
        if let Some(existing) = new_parent.lookup(&self.device, &geom, &new_name)? {
            match (&payload, &existing) {
                (EntryPayload::File { .. }, EntryPayload::Dir { .. }) => {
                    return Err(FsError::IsDirectory)
                }
                (EntryPayload::Dir { .. }, EntryPayload::File { .. }) => {
                    return Err(FsError::NotDirectory)
                }
                (EntryPayload::Dir { .. }, EntryPayload::Dir { pair }) => {
                    let target = self.fetch_pair(*pair)?;
                    if !target.is_empty(&self.device, &geom)? {
                        return Err(FsError::NotEmpty);
                    }
                }
                (EntryPayload::File { .. }, EntryPayload::File { .. }) => {}
            }
        }

        if new_parent.blocks() == old_parent.blocks() {
            // Same pair: one commit makes the rename atomic outright.
            new_parent.commit(
                &self.device,
                &geom,
                &[
                    LogOp::Upsert {
                        name: &new_name,
                        payload,
                    },
                    LogOp::Remove { name: &old_name },
                ],
            )
        } else {
            new_parent.commit(
                &self.device,
                &geom,
                &[LogOp::Upsert {
                    name: &new_name,
                    payload,
                }],
            )?;
            old_parent.commit(&self.device, &geom, &[LogOp::Remove { name: &old_name }])
        }
    }

    /// Report type, size, and name for a path.
    pub fn stat(&self, path: &str) -> Result<EntryInfo> {
        let segments = crate::path::normalize(path)?;
        let Some((leaf, parents)) = segments.split_last() else {
            return Ok(EntryInfo {
                entry_type: EntryType::Directory,
                size: 0,
                name: "/".to_owned(),
            });
        };
        let parent = self.resolve_dir(parents)?;
        let payload = parent
            .lookup(&self.device, self.geometry(), leaf)?
            .ok_or_else(|| FsError::NotFound(path.to_owned()))?;
        Ok(entry_info(leaf.clone(), &payload))
    }

    /// Open a directory for iteration.
    pub fn dir_open(&self, path: &str) -> Result<DirHandle> {
        let segments = crate::path::normalize(path)?;
        let pair = self.resolve_dir(&segments)?;
        Ok(DirHandle {
            pair: pair.blocks(),
            pos: 0,
        })
    }

    /// Yield the next entry, or `None` at the end. Only real entries are
    /// reported; there are no synthetic `.`/`..` entries.
    pub fn dir_read(&self, handle: &mut DirHandle) -> Result<Option<EntryInfo>> {
        let pair = self.fetch_pair(handle.pair)?;
        let entries = pair.entries(&self.device, self.geometry())?;
        let Some(entry) = entries.into_iter().nth(handle.pos) else {
            return Ok(None);
        };
        handle.pos += 1;
        Ok(Some(entry_info(entry.name, &entry.payload)))
    }

    /// Restart iteration from the first entry.
    pub fn dir_rewind(&self, handle: &mut DirHandle) {
        handle.pos = 0;
    }

    /// Destroy a directory handle.
    pub fn dir_close(&self, handle: DirHandle) {
        drop(handle);
    }
}
