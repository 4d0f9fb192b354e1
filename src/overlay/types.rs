use fuser::FUSE_ROOT_ID;
use fxhash::hash64;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub(crate) struct InodeData {
    pub inode: u64,
    pub parent: u64,
    pub name: OsString,
    /// Path relative to the mirrored root.
    pub path: PathBuf,
    /// Outstanding kernel lookups; the entry is dropped when this reaches zero.
    pub lookups: u64,
}

/// Inode numbers handed to the kernel, indexed by number and by (parent, name).
#[derive(Debug)]
pub(crate) struct InodeTable {
    inodes: HashMap<u64, InodeData>,
    children: HashMap<u64, HashMap<u64, u64>>,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = InodeTable {
            inodes: HashMap::new(),
            children: HashMap::new(),
        };
        table.inodes.insert(
            FUSE_ROOT_ID,
            InodeData {
                inode: FUSE_ROOT_ID,
                parent: FUSE_ROOT_ID,
                name: OsString::new(),
                path: PathBuf::new(),
                lookups: 1,
            },
        );
        table
    }

    pub fn insert(&mut self, inode: InodeData) {
        if inode.inode != FUSE_ROOT_ID {
            let name_hash = hash64(inode.name.as_bytes());
            self.children
                .entry(inode.parent)
                .or_default()
                .insert(name_hash, inode.inode);
        }
        self.inodes.insert(inode.inode, inode);
    }

    pub fn peek(&self, ino: u64) -> Option<&InodeData> {
        self.inodes.get(&ino)
    }

    pub fn get_mut(&mut self, ino: u64) -> Option<&mut InodeData> {
        self.inodes.get_mut(&ino)
    }

    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.peek(ino).map(|i| i.path.clone())
    }

    /// Look up a child inode by name within a parent directory.
    pub fn lookup_child(&self, parent: u64, name: &OsStr) -> Option<u64> {
        let name_hash = hash64(name.as_bytes());
        self.children
            .get(&parent)
            .and_then(|map| map.get(&name_hash).copied())
            .filter(|ino| self.inodes.contains_key(ino))
    }

    pub fn remove_child(&mut self, parent: u64, name: &OsStr) -> Option<u64> {
        let name_hash = hash64(name.as_bytes());
        self.children
            .get_mut(&parent)
            .and_then(|map| map.remove(&name_hash))
    }

    /// Drop `nlookup` kernel references; forget the inode once none remain.
    pub fn forget(&mut self, ino: u64, nlookup: u64) {
        if ino == FUSE_ROOT_ID {
            return;
        }
        let remove = match self.inodes.get_mut(&ino) {
            Some(inode) => {
                inode.lookups = inode.lookups.saturating_sub(nlookup);
                inode.lookups == 0
            }
            None => false,
        };
        if remove {
            if let Some(inode) = self.inodes.remove(&ino) {
                let name_hash = hash64(inode.name.as_bytes());
                if let Some(map) = self.children.get_mut(&inode.parent) {
                    if map.get(&name_hash) == Some(&ino) {
                        map.remove(&name_hash);
                    }
                }
            }
        }
    }

    /// Re-home `ino` under a new parent and name, rewriting the relative
    /// paths of everything below it.
    pub fn rename(&mut self, ino: u64, new_parent: u64, new_name: OsString, new_path: PathBuf) {
        let Some(old) = self.inodes.get(&ino).cloned() else {
            return;
        };
        self.remove_child(old.parent, &old.name);
        self.children
            .entry(new_parent)
            .or_default()
            .insert(hash64(new_name.as_bytes()), ino);

        for inode in self.inodes.values_mut() {
            if inode.inode != ino && inode.path.starts_with(&old.path) {
                if let Ok(rest) = inode.path.strip_prefix(&old.path) {
                    inode.path = new_path.join(rest);
                }
            }
        }

        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.parent = new_parent;
            inode.name = new_name;
            inode.path = new_path;
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inodes.len()
    }
}
