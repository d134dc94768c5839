// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use derive_where::derive_where;
use parse_display::Display;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

/// A UUID with type-level information about what it's used for.
///
/// Clusters, nodes, jobs, and tasks are all identified by UUIDs.  If they're
/// all the same type, it's easy to pass a node id where a cluster id was
/// expected.  The marker type parameter prevents that at compile time while
/// still letting code be generic over all typed UUIDs.
#[derive_where(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct TypedUuid<T: TypedUuidKind> {
    uuid: Uuid,
    #[serde(skip)]
    _phantom: std::marker::PhantomData<T>,
}

impl<T: TypedUuidKind> TypedUuid<T> {
    /// Creates a new UUID of this type.
    #[inline]
    pub fn new_v4() -> Self {
        Self { uuid: Uuid::new_v4(), _phantom: std::marker::PhantomData }
    }

    /// Create a new `TypedUuid` from an untyped [`Uuid`].
    ///
    /// It is the caller's responsibility to ensure that the UUID is of the
    /// correct type.
    #[inline]
    pub fn from_untyped(uuid: Uuid) -> Self {
        Self { uuid, _phantom: std::marker::PhantomData }
    }

    /// Returns the inner [`Uuid`].
    #[inline]
    pub fn as_untyped_uuid(&self) -> &Uuid {
        &self.uuid
    }
}

impl<T: TypedUuidKind> fmt::Debug for TypedUuid<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.uuid.fmt(f)?;
        write!(f, " ({})", T::tag())
    }
}

impl<T: TypedUuidKind> fmt::Display for TypedUuid<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.uuid.fmt(f)
    }
}

impl<T: TypedUuidKind> FromStr for TypedUuid<T> {
    type Err = TypedUuidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)
            .map_err(|error| TypedUuidParseError { error, tag: T::tag() })?;
        Ok(Self { uuid, _phantom: std::marker::PhantomData })
    }
}

/// Represents marker types that can be used as a type parameter for
/// [`TypedUuid`].
pub trait TypedUuidKind: Send + Sync + 'static {
    /// Returns the corresponding tag for this kind.
    ///
    /// The tag forms a runtime representation of this type-level value.
    fn tag() -> TypedUuidTag;
}

/// Describes what kind of [`TypedUuid`] something is.
///
/// This is the runtime equivalent of [`TypedUuidKind`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[display(style = "snake_case")]
pub enum TypedUuidTag {
    Cluster,
    Node,
    ClusterJob,
    Task,
}

macro_rules! impl_typed_uuid_kind {
    ($($kind:ident => $tag:ident => $alias:ident),* $(,)?) => {
        $(
            pub enum $kind {}

            impl TypedUuidKind for $kind {
                #[inline]
                fn tag() -> TypedUuidTag {
                    TypedUuidTag::$tag
                }
            }

            pub type $alias = TypedUuid<$kind>;
        )*
    };
}

impl_typed_uuid_kind! {
    ClusterKind => Cluster => ClusterUuid,
    NodeKind => Node => NodeUuid,
    ClusterJobKind => ClusterJob => JobUuid,
    TaskKind => Task => TaskUuid,
}

#[derive(Error, Debug)]
#[error("error parsing uuid for {tag}")]
pub struct TypedUuidParseError {
    #[source]
    pub(crate) error: uuid::Error,
    pub(crate) tag: TypedUuidTag,
}

/// A trait abstracting over typed and untyped UUIDs.
///
/// This trait is similar to `From`, but we don't want to implement
/// `From<TypedUuid<T>> for Uuid` because we want the conversion from typed to
/// untyped UUIDs to be explicit.
pub trait ToUntypedUuid {
    /// Convert `self` into an untyped [`Uuid`].
    fn to_untyped_uuid(self) -> Uuid;
}

impl ToUntypedUuid for Uuid {
    #[inline]
    fn to_untyped_uuid(self) -> Uuid {
        self
    }
}

impl<T: TypedUuidKind> ToUntypedUuid for TypedUuid<T> {
    #[inline]
    fn to_untyped_uuid(self) -> Uuid {
        self.uuid
    }
}
