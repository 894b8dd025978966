//! Type-safe hardware object ID wrappers.
//!
//! Flow handles, pool handles and hairpin binding handles are all plain
//! integers at the driver boundary. The phantom type parameter keeps them
//! from being mixed up on the Rust side.

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

/// Raw object ID type as handed out by the driver.
pub type RawObjectId = u64;

/// Marker trait for hardware object kinds.
pub trait HalObjectKind: Send + Sync + 'static {
    /// Returns the object type name for debugging.
    fn type_name() -> &'static str;
}

/// A type-safe hardware object ID.
///
/// # Examples
///
/// ```
/// use offload_hal::{FlowOid, MempoolOid};
///
/// let flow = FlowOid::from_raw(0x10).unwrap();
/// let pool = MempoolOid::from_raw(0x20).unwrap();
/// assert_eq!(flow.as_raw(), 0x10);
///
/// // This would fail to compile:
/// // fn takes_flow(f: FlowOid) {}
/// // takes_flow(pool);
/// # let _ = pool;
/// ```
#[derive(Clone, Copy)]
pub struct HalObjectId<T: HalObjectKind> {
    raw: RawObjectId,
    _marker: PhantomData<T>,
}

impl<T: HalObjectKind> HalObjectId<T> {
    /// The null object ID.
    pub const NULL: Self = Self {
        raw: 0,
        _marker: PhantomData,
    };

    /// Creates a new object ID from a raw value.
    ///
    /// Returns `None` if the raw value is 0 (null object ID).
    pub fn from_raw(raw: RawObjectId) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self {
                raw,
                _marker: PhantomData,
            })
        }
    }

    /// Returns the raw object ID value.
    pub const fn as_raw(&self) -> RawObjectId {
        self.raw
    }

    /// Returns true if this is a null object ID.
    pub const fn is_null(&self) -> bool {
        self.raw == 0
    }
}

impl<T: HalObjectKind> fmt::Debug for HalObjectId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:x})", T::type_name(), self.raw)
    }
}

impl<T: HalObjectKind> fmt::Display for HalObjectId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.raw)
    }
}

impl<T: HalObjectKind> PartialEq for HalObjectId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T: HalObjectKind> Eq for HalObjectId<T> {}

impl<T: HalObjectKind> PartialOrd for HalObjectId<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: HalObjectKind> Ord for HalObjectId<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl<T: HalObjectKind> Hash for HalObjectId<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T: HalObjectKind> Default for HalObjectId<T> {
    fn default() -> Self {
        Self::NULL
    }
}

macro_rules! define_object_kind {
    ($name:ident, $type_name:literal, $oid_alias:ident) => {
        #[doc = concat!("Marker type for ", $type_name, " objects.")]
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl HalObjectKind for $name {
            fn type_name() -> &'static str {
                $type_name
            }
        }

        #[doc = concat!("Type alias for ", $type_name, " object IDs.")]
        pub type $oid_alias = HalObjectId<$name>;
    };
}

define_object_kind!(FlowKind, "Flow", FlowOid);
define_object_kind!(MempoolKind, "Mempool", MempoolOid);
define_object_kind!(HairpinBindingKind, "HairpinBinding", HairpinBindingOid);
