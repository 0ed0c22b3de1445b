use std::convert::Infallible;

use thiserror::Error;

use crate::target::TargetError;

/// The error type used by [`ObjectModel`] implementations.
#[derive(Error, Debug)]
pub enum ObjectModelError {
    /// A type, variable, or struct member does not exist in the target's
    /// debug info.
    ///
    /// Kernel struct layouts change across versions, so this variant doubles
    /// as control flow: the module and section iterators catch it at known
    /// fallback sites (`core_layout` vs. `module_core`, `battr` vs. `name`)
    /// and retry with the older member names. Everywhere else it propagates.
    #[error("lookup failed: {0}")]
    Lookup(String),

    #[error("{0}")]
    Other(TargetError),
}

impl ObjectModelError {
    pub fn is_lookup(&self) -> bool {
        matches!(self, ObjectModelError::Lookup(_))
    }
}

/// Converts a `Lookup` failure into `None` and passes every other error
/// through. This is the single place where "member absent" is allowed to be
/// recoverable.
pub(crate) fn recover_lookup<T>(
    result: Result<T, ObjectModelError>,
) -> Result<Option<T>, ObjectModelError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_lookup() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Typed access to objects in the target kernel, backed by vmlinux debug
/// info.
///
/// This is the contract the kernel-walk module iterator runs against. An
/// `Object` is a value or lvalue in the target (an address paired with a
/// type); the operations mirror C expression syntax: `member` is `a.b`,
/// `member_dereference` is `a->b`, `subscript` is `a[i]`.
pub trait ObjectModel {
    type Object: Clone;
    type Type: Clone;

    fn find_type(&self, name: &str) -> Result<Self::Type, ObjectModelError>;
    fn find_object(&self, name: &str) -> Result<Self::Object, ObjectModelError>;
    fn address_of(&self, obj: &Self::Object) -> Result<Self::Object, ObjectModelError>;
    /// Read the object's value out of target memory.
    fn read(&self, obj: &Self::Object) -> Result<Self::Object, ObjectModelError>;
    fn read_unsigned(&self, obj: &Self::Object) -> Result<u64, ObjectModelError>;
    fn read_c_string(&self, obj: &Self::Object) -> Result<String, ObjectModelError>;
    fn member(&self, obj: &Self::Object, name: &str) -> Result<Self::Object, ObjectModelError>;
    fn member_dereference(
        &self,
        obj: &Self::Object,
        name: &str,
    ) -> Result<Self::Object, ObjectModelError>;
    /// Given a pointer to `member` inside `ty`, produce a pointer to the
    /// enclosing object.
    fn container_of(
        &self,
        ptr: &Self::Object,
        ty: &Self::Type,
        member: &str,
    ) -> Result<Self::Object, ObjectModelError>;
    fn subscript(&self, obj: &Self::Object, index: u64) -> Result<Self::Object, ObjectModelError>;
}

/// Placeholder model for live sessions that enumerate modules through
/// `/proc` and `/sys` and never walk kernel structures.
pub struct NoObjectModel;

impl ObjectModel for NoObjectModel {
    type Object = Infallible;
    type Type = Infallible;

    fn find_type(&self, name: &str) -> Result<Self::Type, ObjectModelError> {
        Err(ObjectModelError::Lookup(name.to_string()))
    }

    fn find_object(&self, name: &str) -> Result<Self::Object, ObjectModelError> {
        Err(ObjectModelError::Lookup(name.to_string()))
    }

    fn address_of(&self, obj: &Self::Object) -> Result<Self::Object, ObjectModelError> {
        match *obj {}
    }

    fn read(&self, obj: &Self::Object) -> Result<Self::Object, ObjectModelError> {
        match *obj {}
    }

    fn read_unsigned(&self, obj: &Self::Object) -> Result<u64, ObjectModelError> {
        match *obj {}
    }

    fn read_c_string(&self, obj: &Self::Object) -> Result<String, ObjectModelError> {
        match *obj {}
    }

    fn member(&self, obj: &Self::Object, _name: &str) -> Result<Self::Object, ObjectModelError> {
        match *obj {}
    }

    fn member_dereference(
        &self,
        obj: &Self::Object,
        _name: &str,
    ) -> Result<Self::Object, ObjectModelError> {
        match *obj {}
    }

    fn container_of(
        &self,
        _ptr: &Self::Object,
        ty: &Self::Type,
        _member: &str,
    ) -> Result<Self::Object, ObjectModelError> {
        match *ty {}
    }

    fn subscript(&self, obj: &Self::Object, _index: u64) -> Result<Self::Object, ObjectModelError> {
        match *obj {}
    }
}
