//! Entity descriptions for the Kiln metadata model
//!
//! Everything the compiler knows about a program is expressed as an entity:
//! a type, a method, a field, a signature, or a method body's local-variable
//! list. Entities are immutable once registered in the [`MetadataStore`] and
//! are referred to by dense integer ids.
//!
//! [`MetadataStore`]: crate::store::MetadataStore

use std::fmt;

use rustc_hash::FxHashMap;

/// Unique identifier for a type in the metadata store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub(crate) u32);

/// Unique identifier for a method in the metadata store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub(crate) u32);

/// Unique identifier for a field in the metadata store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub(crate) u32);

/// Unique identifier for a method signature in the metadata store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SigId(pub(crate) u32);

/// Unique identifier for a method body in the metadata store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyId(pub(crate) u32);

macro_rules! impl_id {
    ($name:ident, $label:expr) => {
        impl $name {
            /// Index into the store's backing vector
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "({})"), self.0)
            }
        }
    };
}

impl_id!(TypeId, "TypeId");
impl_id!(MethodId, "MethodId");
impl_id!(FieldId, "FieldId");
impl_id!(SigId, "SigId");
impl_id!(BodyId, "BodyId");

/// A reference to any entity kind.
///
/// This is a closed sum: consumers pattern-match on the variant explicitly,
/// so adding a kind is a compile-visible change everywhere it matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entity {
    Type(TypeId),
    Method(MethodId),
    Field(FieldId),
    Signature(SigId),
    /// The local-variable list of a method body
    Locals(BodyId),
}

impl Entity {
    pub fn as_type(self) -> Option<TypeId> {
        match self {
            Entity::Type(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_method(self) -> Option<MethodId> {
        match self {
            Entity::Method(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_field(self) -> Option<FieldId> {
        match self {
            Entity::Field(f) => Some(f),
            _ => None,
        }
    }

    /// Short label for error messages
    pub fn kind_name(self) -> &'static str {
        match self {
            Entity::Type(_) => "type",
            Entity::Method(_) => "method",
            Entity::Field(_) => "field",
            Entity::Signature(_) => "signature",
            Entity::Locals(_) => "locals",
        }
    }
}

/// Built-in primitive types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Void,
    Bool,
    Char,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    IntPtr,
    UIntPtr,
}

impl PrimitiveKind {
    /// Size in bytes for a given target pointer width
    pub fn size(self, pointer_size: u32) -> u32 {
        match self {
            PrimitiveKind::Void => 0,
            PrimitiveKind::Bool | PrimitiveKind::I8 | PrimitiveKind::U8 => 1,
            PrimitiveKind::Char | PrimitiveKind::I16 | PrimitiveKind::U16 => 2,
            PrimitiveKind::I32 | PrimitiveKind::U32 | PrimitiveKind::F32 => 4,
            PrimitiveKind::I64 | PrimitiveKind::U64 | PrimitiveKind::F64 => 8,
            PrimitiveKind::IntPtr | PrimitiveKind::UIntPtr => pointer_size,
        }
    }

    /// Natural alignment (same as size, except void)
    pub fn align(self, pointer_size: u32) -> u32 {
        self.size(pointer_size).max(1)
    }

    pub fn name(self) -> &'static str {
        match self {
            PrimitiveKind::Void => "Void",
            PrimitiveKind::Bool => "Bool",
            PrimitiveKind::Char => "Char",
            PrimitiveKind::I8 => "Int8",
            PrimitiveKind::U8 => "UInt8",
            PrimitiveKind::I16 => "Int16",
            PrimitiveKind::U16 => "UInt16",
            PrimitiveKind::I32 => "Int32",
            PrimitiveKind::U32 => "UInt32",
            PrimitiveKind::I64 => "Int64",
            PrimitiveKind::U64 => "UInt64",
            PrimitiveKind::F32 => "Float32",
            PrimitiveKind::F64 => "Float64",
            PrimitiveKind::IntPtr => "IntPtr",
            PrimitiveKind::UIntPtr => "UIntPtr",
        }
    }
}

/// A generic parameter position: slot `index` of the enclosing type or method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenericParamRef {
    pub index: u16,
    /// True for a method-level parameter, false for a type-level one
    pub from_method: bool,
}

/// The shape of a type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Primitive(PrimitiveKind),
    Class,
    ValueType,
    Interface,
    Delegate,
    /// Single-dimensional array with the given element type
    Array { element: TypeId },
    /// Managed pointer (by-ref) to the pointee
    ByRef { pointee: TypeId },
    /// Unmanaged pointer to the pointee
    Pointer { pointee: TypeId },
    /// An open generic parameter of a definition
    Param(GenericParamRef),
    /// The canonical placeholder standing in for any reference-type argument
    /// of a shared generic instantiation
    Canon,
}

/// Attribute bits of a type definition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeFlags {
    pub is_sealed: bool,
    pub is_abstract: bool,
    pub explicit_layout: bool,
    /// Static initializer may run at any point before the first static
    /// field access (as opposed to precise, lazy triggering)
    pub before_field_init: bool,
    /// Stack-only type: must never be boxed or placed on the heap
    pub is_byref_like: bool,
    /// Recognized by the compiler and substituted with special handling
    pub is_intrinsic: bool,
    /// Has a static class constructor
    pub has_cctor: bool,
}

/// A type entity
#[derive(Debug, Clone)]
pub struct TypeDesc {
    pub id: TypeId,
    pub name: String,
    pub kind: TypeKind,
    pub base: Option<TypeId>,
    /// Implemented interfaces, direct only (transitive set is computed)
    pub interfaces: Vec<TypeId>,
    /// Declared fields in layout order (instance and static)
    pub fields: Vec<FieldId>,
    /// For an instantiation, the open definition it was created from
    pub generic_def: Option<TypeId>,
    /// Type arguments of an instantiation (empty on definitions)
    pub generic_args: Vec<TypeId>,
    /// Number of generic parameters on the definition
    pub generic_arity: u16,
    pub flags: TypeFlags,
    /// Instance byte size; `None` while the type is open or not laid out
    pub instance_size: Option<u32>,
    /// Instance alignment in bytes
    pub alignment: u32,
}

impl TypeDesc {
    pub fn is_interface(&self) -> bool {
        matches!(self.kind, TypeKind::Interface)
    }

    pub fn is_value_type(&self) -> bool {
        matches!(self.kind, TypeKind::ValueType | TypeKind::Primitive(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, TypeKind::Array { .. })
    }

    pub fn is_open(&self) -> bool {
        matches!(self.kind, TypeKind::Param(_)) || self.generic_arity > 0 && self.generic_args.is_empty()
    }
}

/// Attribute bits of a method
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodFlags {
    pub is_static: bool,
    pub is_virtual: bool,
    pub is_final: bool,
    pub is_abstract: bool,
    pub is_ctor: bool,
    /// Recognized by the compiler and lowered to a helper call
    pub is_intrinsic: bool,
    /// Callable only from native code; a managed call site may take its
    /// address but never invoke it directly
    pub native_only: bool,
}

/// A method entity
#[derive(Debug, Clone)]
pub struct MethodDesc {
    pub id: MethodId,
    pub name: String,
    pub owner: TypeId,
    pub sig: SigId,
    pub flags: MethodFlags,
    /// For an instantiation, the open definition it was created from
    pub generic_def: Option<MethodId>,
    /// Method-level type arguments (empty on definitions and non-generics)
    pub generic_args: Vec<TypeId>,
    /// Number of method-level generic parameters on the definition
    pub generic_arity: u16,
    /// Body of the definition; instantiations share the definition's body
    pub body: Option<BodyId>,
    /// Slot in the owner's virtual table, for virtual methods
    pub vtable_slot: Option<u16>,
}

/// Attribute bits of a field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldFlags {
    pub is_static: bool,
    /// Compile-time constant; has no runtime storage
    pub is_literal: bool,
    /// Static field mapped to initializer data in the image
    pub has_rva: bool,
}

/// A field entity
#[derive(Debug, Clone)]
pub struct FieldDesc {
    pub id: FieldId,
    pub name: String,
    pub owner: TypeId,
    pub ty: TypeId,
    /// Byte offset within the owner's instance layout (0 for statics)
    pub offset: u32,
    pub flags: FieldFlags,
}

/// A method signature
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SigDesc {
    pub params: Vec<TypeId>,
    pub ret: TypeId,
    pub has_this: bool,
    pub is_vararg: bool,
    /// Generic arity carried by the signature (matches the method's)
    pub generic_arity: u16,
}

/// One entry in a method body's token table
#[derive(Debug, Clone, Copy)]
pub struct TokenEntry {
    pub entity: Entity,
    /// The token names the element type of an array construction site;
    /// resolution promotes it to the array type
    pub as_array: bool,
}

/// A method body: the token table and local-variable list of a definition.
///
/// Shared generic instantiations reuse their definition's body; token
/// entries are stored in the definition's open form and are instantiated
/// during resolution.
#[derive(Debug, Clone)]
pub struct MethodBody {
    pub id: BodyId,
    /// The definition method this body belongs to
    pub method: MethodId,
    pub tokens: FxHashMap<u32, TokenEntry>,
    /// String-literal tokens appearing in the body
    pub strings: FxHashMap<u32, String>,
    pub locals: Vec<TypeId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_sizes() {
        assert_eq!(PrimitiveKind::Bool.size(8), 1);
        assert_eq!(PrimitiveKind::I32.size(8), 4);
        assert_eq!(PrimitiveKind::F64.size(8), 8);
        assert_eq!(PrimitiveKind::IntPtr.size(8), 8);
        assert_eq!(PrimitiveKind::IntPtr.size(4), 4);
        assert_eq!(PrimitiveKind::Void.size(8), 0);
        assert_eq!(PrimitiveKind::Void.align(8), 1);
    }

    #[test]
    fn test_entity_accessors() {
        let e = Entity::Type(TypeId(3));
        assert_eq!(e.as_type(), Some(TypeId(3)));
        assert_eq!(e.as_method(), None);
        assert_eq!(e.kind_name(), "type");
    }

    #[test]
    fn test_id_display() {
        assert_eq!(TypeId(7).to_string(), "TypeId(7)");
        assert_eq!(MethodId(1).to_string(), "MethodId(1)");
    }
}
