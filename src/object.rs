//! The object model: typing directories and walking object trees.

use std::collections::VecDeque;

use crate::coordinator::StorageCoordinator;
use crate::error::StorageError;
use crate::uri::Uri;

/// The kind of object at a URI, determined by the sentinel file present in
/// its directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectType {
    /// An array (`__array_schema.tdb` present).
    Array,
    /// A key-value array (`__kv_schema.tdb` present).
    KeyValue,
    /// A group (`__tiledb_group.tdb` present).
    Group,
    /// Not a recognized object.
    Invalid,
}

/// Traversal order of an object-tree walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkOrder {
    /// Parents before children.
    Preorder,
    /// Children before parents.
    Postorder,
}

/// A stateful cursor over the objects beneath a path.
///
/// Produced by
/// [`StorageCoordinator::object_iter_begin`]; the cursor is released by
/// dropping it.
#[derive(Debug)]
pub struct ObjectIter {
    objs: VecDeque<Uri>,
    // Parallel to `objs` in postorder walks: whether the entry's children
    // have already been enqueued.
    expanded: VecDeque<bool>,
    order: WalkOrder,
    recursive: bool,
}

impl ObjectIter {
    pub(crate) fn new(objs: Vec<Uri>, order: WalkOrder, recursive: bool) -> Self {
        let expanded = if order == WalkOrder::Postorder {
            objs.iter().map(|_| false).collect()
        } else {
            VecDeque::new()
        };
        Self {
            objs: objs.into(),
            expanded,
            order,
            recursive,
        }
    }

    /// Advance the cursor and return the next object, or `None` when the
    /// walk is complete.
    pub fn next(
        &mut self,
        sm: &StorageCoordinator,
    ) -> Result<Option<(Uri, ObjectType)>, StorageError> {
        if self.objs.is_empty() {
            return Ok(None);
        }
        match self.order {
            WalkOrder::Preorder => self.next_preorder(sm),
            WalkOrder::Postorder => self.next_postorder(sm),
        }
    }

    fn next_preorder(
        &mut self,
        sm: &StorageCoordinator,
    ) -> Result<Option<(Uri, ObjectType)>, StorageError> {
        let front = self.objs.pop_front().expect("checked non-empty");
        let object_type = sm.object_type(&front)?;
        if self.recursive {
            // Prepend the children in reverse so the original order is
            // preserved at the front of the deque.
            let children = sm.vfs().ls(&front)?;
            for child in children.into_iter().rev() {
                if sm.object_type(&child)? != ObjectType::Invalid {
                    self.objs.push_front(child);
                }
            }
        }
        Ok(Some((front, object_type)))
    }

    fn next_postorder(
        &mut self,
        sm: &StorageCoordinator,
    ) -> Result<Option<(Uri, ObjectType)>, StorageError> {
        // Expand the front of the deque until it stops growing, then the
        // front is a deepest-first object.
        while !*self.expanded.front().expect("parallel deque") {
            let before = self.objs.len();
            let front = self.objs.front().expect("checked non-empty").clone();
            *self.expanded.front_mut().expect("parallel deque") = true;
            let children = sm.vfs().ls(&front)?;
            for child in children.into_iter().rev() {
                if sm.object_type(&child)? != ObjectType::Invalid {
                    self.objs.push_front(child);
                    self.expanded.push_front(false);
                }
            }
            if self.objs.len() == before {
                break;
            }
        }
        let front = self.objs.pop_front().expect("checked non-empty");
        self.expanded.pop_front();
        let object_type = sm.object_type(&front)?;
        Ok(Some((front, object_type)))
    }
}
