// The content-addressed object store.
//
// Objects are immutable and live behind Names computed from their
// canonical byte encoding. Each kind has its own submap, so a lookup
// consults exactly the table the Name's kind selects and a Name of the
// wrong kind is simply absent. Insertion is idempotent by content:
// putting the same bytes twice yields the same Name and one entry.
//
// The canonical encodings are byte-exact so that digests reproduce
// across implementations:
//
//   Blob:  the raw bytes.
//   Tree:  u64 little-endian entry count, then each Name's 32 bytes.
//   Thunk: the wrapped Tree's Name with its kind byte set to Thunk.
//   Tag:   the wrapped Tree's Name with its kind byte set to Tag.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::name::{Kind, Name};


#[derive(Clone, Debug, PartialEq)]
pub enum Object {
    Blob(Vec<u8>),
    Tree(Vec<Name>),
    // A deferred application of the wrapped Tree.
    Thunk(Name),
    // An assertion about another Name, wrapped the same way.
    Tag(Name),
}


impl Object {
    // The digest input for this object. Every stored object satisfies
    // digest(canonical(object)) == the digest field of its Name.
    pub fn canonical(&self) -> Vec<u8> {
        match self {
            Object::Blob(bytes) => bytes.clone(),
            Object::Tree(entries) => {
                let mut out = Vec::with_capacity(8 + entries.len() * 32);
                out.extend_from_slice(&(entries.len() as u64).to_le_bytes());
                for entry in entries {
                    out.extend_from_slice(entry.as_bytes());
                }
                out
            }
            Object::Thunk(tree) => tree.retag(Kind::Thunk).as_bytes().to_vec(),
            Object::Tag(tree) => tree.retag(Kind::Tag).as_bytes().to_vec(),
        }
    }

    fn kind(&self) -> Kind {
        match self {
            Object::Blob(_) => Kind::Blob,
            Object::Tree(_) => Kind::Tree,
            Object::Thunk(_) => Kind::Thunk,
            Object::Tag(_) => Kind::Tag,
        }
    }

    fn size(&self) -> u64 {
        match self {
            Object::Blob(bytes) => bytes.len() as u64,
            Object::Tree(entries) => entries.len() as u64,
            Object::Thunk(tree) => tree.size(),
            Object::Tag(tree) => tree.size(),
        }
    }
}


// Compute the Name an object will get, without touching any store.
pub fn name_of(object: &Object) -> Name {
    let digest = Sha256::digest(&object.canonical());
    Name::from_digest(object.kind(), digest.as_slice(), object.size())
}


pub struct Store {
    blobs: RwLock<HashMap<Name, Arc<Vec<u8>>>>,
    trees: RwLock<HashMap<Name, Arc<Vec<Name>>>>,
    thunks: RwLock<HashMap<Name, Name>>,
    tags: RwLock<HashMap<Name, Name>>,
}


impl Store {
    pub fn new() -> Store {
        Store {
            blobs: RwLock::new(HashMap::new()),
            trees: RwLock::new(HashMap::new()),
            thunks: RwLock::new(HashMap::new()),
            tags: RwLock::new(HashMap::new()),
        }
    }

    // Insert an object, returning its Name. A Tree may only be
    // finalized once every entry resolves; a Thunk or Tag must wrap a
    // Tree that is already present.
    pub fn put(&self, object: Object) -> Result<Name> {
        match &object {
            Object::Tree(entries) => {
                for entry in entries {
                    if !self.contains(*entry) {
                        return Err(Error::UnknownName(*entry));
                    }
                }
            }
            Object::Thunk(tree) | Object::Tag(tree) => {
                if tree.kind() != Kind::Tree {
                    return Err(Error::NotATree(*tree));
                }
                if !self.contains(*tree) {
                    return Err(Error::UnknownName(*tree));
                }
            }
            Object::Blob(_) => {}
        }

        let name = name_of(&object);
        match object {
            Object::Blob(bytes) => {
                self.blobs.write().unwrap().entry(name).or_insert_with(|| Arc::new(bytes));
            }
            Object::Tree(entries) => {
                self.trees.write().unwrap().entry(name).or_insert_with(|| Arc::new(entries));
            }
            Object::Thunk(tree) => {
                self.thunks.write().unwrap().entry(name).or_insert(tree);
            }
            Object::Tag(tree) => {
                self.tags.write().unwrap().entry(name).or_insert(tree);
            }
        }
        trace!("store: put {:?}", name);
        Ok(name)
    }

    pub fn get(&self, name: Name) -> Result<Object> {
        match name.kind() {
            Kind::Literal => {
                let payload = name.payload().expect("literal names carry a payload");
                Ok(Object::Blob(payload.to_vec()))
            }
            Kind::Blob => self
                .blobs
                .read()
                .unwrap()
                .get(&name)
                .map(|bytes| Object::Blob(bytes.as_ref().clone()))
                .ok_or(Error::UnknownName(name)),
            Kind::Tree => self
                .trees
                .read()
                .unwrap()
                .get(&name)
                .map(|entries| Object::Tree(entries.as_ref().clone()))
                .ok_or(Error::UnknownName(name)),
            Kind::Thunk => self
                .thunks
                .read()
                .unwrap()
                .get(&name)
                .map(|tree| Object::Thunk(*tree))
                .ok_or(Error::UnknownName(name)),
            Kind::Tag => self
                .tags
                .read()
                .unwrap()
                .get(&name)
                .map(|tree| Object::Tag(*tree))
                .ok_or(Error::UnknownName(name)),
        }
    }

    pub fn contains(&self, name: Name) -> bool {
        match name.kind() {
            Kind::Literal => true,
            Kind::Blob => self.blobs.read().unwrap().contains_key(&name),
            Kind::Tree => self.trees.read().unwrap().contains_key(&name),
            Kind::Thunk => self.thunks.read().unwrap().contains_key(&name),
            Kind::Tag => self.tags.read().unwrap().contains_key(&name),
        }
    }

    // Byte contents of a Blob or Literal, shared.
    pub fn blob(&self, name: Name) -> Result<Arc<Vec<u8>>> {
        match name.kind() {
            Kind::Literal => {
                let payload = name.payload().expect("literal names carry a payload");
                Ok(Arc::new(payload.to_vec()))
            }
            Kind::Blob => self
                .blobs
                .read()
                .unwrap()
                .get(&name)
                .cloned()
                .ok_or(Error::UnknownName(name)),
            _ => Err(Error::UnknownName(name)),
        }
    }

    // Entries of a Tree, shared.
    pub fn tree(&self, name: Name) -> Result<Arc<Vec<Name>>> {
        self.trees
            .read()
            .unwrap()
            .get(&name)
            .cloned()
            .ok_or(Error::UnknownName(name))
    }

    // The Tree a Thunk or Tag wraps.
    pub fn target(&self, name: Name) -> Result<Name> {
        let table = match name.kind() {
            Kind::Thunk => &self.thunks,
            Kind::Tag => &self.tags,
            _ => return Err(Error::UnknownName(name)),
        };
        table
            .read()
            .unwrap()
            .get(&name)
            .copied()
            .ok_or(Error::UnknownName(name))
    }

    // Total number of stored entries across all submaps.
    pub fn len(&self) -> usize {
        self.blobs.read().unwrap().len()
            + self.trees.read().unwrap().len()
            + self.thunks.read().unwrap().len()
            + self.tags.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn blob(bytes: &[u8]) -> Object {
        Object::Blob(bytes.to_vec())
    }

    #[test]
    fn test_blob_roundtrip() {
        let store = Store::new();
        let name = store.put(blob(b"hello")).unwrap();
        assert_eq!(name.kind(), Kind::Blob);
        assert_eq!(name.size(), 5);
        assert_eq!(store.get(name).unwrap(), blob(b"hello"));
        assert!(store.contains(name));
    }

    #[test]
    fn test_put_is_idempotent() {
        let store = Store::new();
        let first = store.put(blob(b"same")).unwrap();
        let second = store.put(blob(b"same")).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_distinct_content_distinct_names() {
        let store = Store::new();
        let a = store.put(blob(b"a")).unwrap();
        let b = store.put(blob(b"b")).unwrap();
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_unknown_name() {
        let store = Store::new();
        let name = name_of(&blob(b"never stored"));
        assert!(!store.contains(name));
        assert_eq!(store.get(name), Err(Error::UnknownName(name)));
    }

    #[test]
    fn test_literal_resolves_without_store_entry() {
        let store = Store::new();
        let name = Name::literal(b"inline").unwrap();
        assert!(store.contains(name));
        assert_eq!(store.get(name).unwrap(), blob(b"inline"));
        assert_eq!(store.blob(name).unwrap().as_ref(), &b"inline".to_vec());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_tree_roundtrip() {
        let store = Store::new();
        let a = store.put(blob(b"a")).unwrap();
        let b = Name::literal(b"b").unwrap();
        let tree = store.put(Object::Tree(vec![a, b])).unwrap();
        assert_eq!(tree.kind(), Kind::Tree);
        assert_eq!(tree.size(), 2);
        assert_eq!(store.tree(tree).unwrap().as_ref(), &vec![a, b]);
    }

    #[test]
    fn test_tree_rejects_dangling_entries() {
        let store = Store::new();
        let missing = name_of(&blob(b"dangling"));
        assert_eq!(
            store.put(Object::Tree(vec![missing])),
            Err(Error::UnknownName(missing))
        );
    }

    #[test]
    fn test_thunk_wraps_tree() {
        let store = Store::new();
        let arg = Name::literal(b"x").unwrap();
        let tree = store.put(Object::Tree(vec![arg])).unwrap();
        let thunk = store.put(Object::Thunk(tree)).unwrap();
        assert_eq!(thunk.kind(), Kind::Thunk);
        assert_eq!(store.target(thunk).unwrap(), tree);

        // Wrapping anything but a Tree is rejected.
        let blob_name = store.put(blob(b"not a tree")).unwrap();
        assert_eq!(
            store.put(Object::Thunk(blob_name)),
            Err(Error::NotATree(blob_name))
        );
    }

    #[test]
    fn test_thunk_identity_follows_tree() {
        let store = Store::new();
        let arg = Name::literal(b"x").unwrap();
        let tree = store.put(Object::Tree(vec![arg])).unwrap();
        let thunk = store.put(Object::Thunk(tree)).unwrap();
        let tag = store.put(Object::Tag(tree)).unwrap();
        // Same wrapped tree, different kinds, distinct names.
        assert_ne!(thunk, tag);
        assert_eq!(thunk.size(), tree.size());
    }

    #[test]
    fn test_digest_invariant() {
        let store = Store::new();
        let a = store.put(blob(b"payload")).unwrap();
        let tree = store.put(Object::Tree(vec![a])).unwrap();
        let thunk = store.put(Object::Thunk(tree)).unwrap();

        for name in &[a, tree, thunk] {
            let object = store.get(*name).unwrap();
            assert_eq!(name_of(&object), *name);
        }
    }
}
