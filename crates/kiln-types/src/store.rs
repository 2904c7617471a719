//! Central registry for all metadata entities.
//!
//! The [`MetadataStore`] owns every type, method, field, signature, and
//! method body the compiler knows about, and interns constructed forms
//! (arrays, by-refs, pointers, generic instantiations) so that structural
//! identity is pointer-free id equality. It is the metadata-provider
//! surface the JIT bridge consumes: entity lookup, attribute and signature
//! accessors, method bodies, well-known types, and RVA initializer data.

use rustc_hash::FxHashMap;

use crate::entity::{
    BodyId, Entity, FieldDesc, FieldFlags, FieldId, GenericParamRef, MethodBody, MethodDesc,
    MethodFlags, MethodId, PrimitiveKind, SigDesc, SigId, TokenEntry, TypeDesc, TypeFlags, TypeId,
    TypeKind,
};
use crate::error::TypeError;

/// Ids of the types every compilation needs to name directly.
///
/// Populated once in [`MetadataStore::new`] and never changed afterwards.
#[derive(Debug, Clone, Copy)]
pub struct WellKnownTypes {
    /// The root of the reference-type hierarchy
    pub object: TypeId,
    /// The string type (sealed, variable-size, allocator-constructed)
    pub string: TypeId,
    /// The value type wrapping a raw type handle
    pub runtime_type_handle: TypeId,
    /// The canonical placeholder for shared generic instantiations
    pub canon: TypeId,
}

/// Everything needed to register a new named type
#[derive(Debug, Clone)]
pub struct TypeSpec {
    pub name: String,
    pub kind: TypeKind,
    pub base: Option<TypeId>,
    pub interfaces: Vec<TypeId>,
    pub generic_arity: u16,
    pub flags: TypeFlags,
}

/// Central registry for all metadata entities
pub struct MetadataStore {
    pointer_size: u32,

    // Storage - ids are indices into these vectors
    types: Vec<TypeDesc>,
    methods: Vec<MethodDesc>,
    fields: Vec<FieldDesc>,
    sigs: Vec<SigDesc>,
    bodies: Vec<MethodBody>,

    // Interning of constructed forms
    sig_index: FxHashMap<SigDesc, SigId>,
    primitive_index: FxHashMap<PrimitiveKind, TypeId>,
    array_index: FxHashMap<TypeId, TypeId>,
    byref_index: FxHashMap<TypeId, TypeId>,
    pointer_index: FxHashMap<TypeId, TypeId>,
    param_index: FxHashMap<GenericParamRef, TypeId>,
    inst_type_index: FxHashMap<(TypeId, Vec<TypeId>), TypeId>,
    inst_method_index: FxHashMap<(MethodId, TypeId, Vec<TypeId>), MethodId>,
    inst_field_index: FxHashMap<(FieldId, TypeId), FieldId>,

    rva_data: FxHashMap<FieldId, Vec<u8>>,
    well_known: WellKnownTypes,
}

impl MetadataStore {
    /// Create a store for the given target pointer width (4 or 8 bytes),
    /// pre-registering the primitives and well-known types.
    pub fn new(pointer_size: u32) -> Self {
        let mut store = MetadataStore {
            pointer_size,
            types: Vec::new(),
            methods: Vec::new(),
            fields: Vec::new(),
            sigs: Vec::new(),
            bodies: Vec::new(),
            sig_index: FxHashMap::default(),
            primitive_index: FxHashMap::default(),
            array_index: FxHashMap::default(),
            byref_index: FxHashMap::default(),
            pointer_index: FxHashMap::default(),
            param_index: FxHashMap::default(),
            inst_type_index: FxHashMap::default(),
            inst_method_index: FxHashMap::default(),
            inst_field_index: FxHashMap::default(),
            rva_data: FxHashMap::default(),
            // Placeholder ids, fixed up below
            well_known: WellKnownTypes {
                object: TypeId(0),
                string: TypeId(0),
                runtime_type_handle: TypeId(0),
                canon: TypeId(0),
            },
        };

        let object = store.define_type(TypeSpec {
            name: "Object".to_string(),
            kind: TypeKind::Class,
            base: None,
            interfaces: vec![],
            generic_arity: 0,
            flags: TypeFlags::default(),
        });
        store.finish_layout(object).expect("Object layout");

        let string = store.define_type(TypeSpec {
            name: "String".to_string(),
            kind: TypeKind::Class,
            base: Some(object),
            interfaces: vec![],
            generic_arity: 0,
            flags: TypeFlags {
                is_sealed: true,
                is_intrinsic: true,
                ..TypeFlags::default()
            },
        });
        store.finish_layout(string).expect("String layout");

        let canon = store.define_type(TypeSpec {
            name: "__Canon".to_string(),
            kind: TypeKind::Canon,
            base: Some(object),
            interfaces: vec![],
            generic_arity: 0,
            flags: TypeFlags::default(),
        });

        let rth = store.define_type(TypeSpec {
            name: "RuntimeTypeHandle".to_string(),
            kind: TypeKind::ValueType,
            base: None,
            interfaces: vec![],
            generic_arity: 0,
            flags: TypeFlags {
                is_sealed: true,
                ..TypeFlags::default()
            },
        });
        let intptr = store.primitive(PrimitiveKind::IntPtr);
        store.add_field(rth, "_value", intptr, FieldFlags::default(), None);
        store.finish_layout(rth).expect("RuntimeTypeHandle layout");

        store.well_known = WellKnownTypes {
            object,
            string,
            runtime_type_handle: rth,
            canon,
        };
        store
    }

    pub fn pointer_size(&self) -> u32 {
        self.pointer_size
    }

    pub fn well_known(&self) -> &WellKnownTypes {
        &self.well_known
    }

    // -------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------

    pub fn type_desc(&self, id: TypeId) -> &TypeDesc {
        &self.types[id.index()]
    }

    pub fn method(&self, id: MethodId) -> &MethodDesc {
        &self.methods[id.index()]
    }

    pub fn field(&self, id: FieldId) -> &FieldDesc {
        &self.fields[id.index()]
    }

    pub fn sig(&self, id: SigId) -> &SigDesc {
        &self.sigs[id.index()]
    }

    pub fn body(&self, id: BodyId) -> &MethodBody {
        &self.bodies[id.index()]
    }

    pub fn type_name(&self, id: TypeId) -> &str {
        &self.types[id.index()].name
    }

    /// Human-readable name of any entity, for error messages
    pub fn entity_name(&self, e: Entity) -> String {
        match e {
            Entity::Type(t) => self.type_name(t).to_string(),
            Entity::Method(m) => {
                let m = self.method(m);
                format!("{}.{}", self.type_name(m.owner), m.name)
            }
            Entity::Field(f) => {
                let f = self.field(f);
                format!("{}.{}", self.type_name(f.owner), f.name)
            }
            Entity::Signature(s) => format!("sig#{}", s.index()),
            Entity::Locals(b) => format!("locals#{}", b.index()),
        }
    }

    // -------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------

    /// Register a new named type definition
    pub fn define_type(&mut self, spec: TypeSpec) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(TypeDesc {
            id,
            name: spec.name,
            kind: spec.kind,
            base: spec.base,
            interfaces: spec.interfaces,
            fields: Vec::new(),
            generic_def: None,
            generic_args: Vec::new(),
            generic_arity: spec.generic_arity,
            flags: spec.flags,
            instance_size: None,
            alignment: 1,
        });
        id
    }

    /// Get or intern the id for a primitive type
    pub fn primitive(&mut self, kind: PrimitiveKind) -> TypeId {
        if let Some(&id) = self.primitive_index.get(&kind) {
            return id;
        }
        let size = kind.size(self.pointer_size);
        let id = TypeId(self.types.len() as u32);
        self.types.push(TypeDesc {
            id,
            name: kind.name().to_string(),
            kind: TypeKind::Primitive(kind),
            base: None,
            interfaces: Vec::new(),
            fields: Vec::new(),
            generic_def: None,
            generic_args: Vec::new(),
            generic_arity: 0,
            flags: TypeFlags {
                is_sealed: true,
                ..TypeFlags::default()
            },
            instance_size: Some(size),
            alignment: kind.align(self.pointer_size),
        });
        self.primitive_index.insert(kind, id);
        id
    }

    /// Get or intern the single-dimensional array type over `element`
    pub fn array_of(&mut self, element: TypeId) -> TypeId {
        if let Some(&id) = self.array_index.get(&element) {
            return id;
        }
        let name = format!("{}[]", self.type_name(element));
        let object = self.well_known.object;
        let id = TypeId(self.types.len() as u32);
        self.types.push(TypeDesc {
            id,
            name,
            kind: TypeKind::Array { element },
            base: Some(object),
            interfaces: Vec::new(),
            fields: Vec::new(),
            generic_def: None,
            generic_args: Vec::new(),
            generic_arity: 0,
            flags: TypeFlags {
                is_sealed: true,
                ..TypeFlags::default()
            },
            instance_size: None,
            alignment: self.pointer_size,
        });
        self.array_index.insert(element, id);
        id
    }

    /// Get or intern the managed-pointer type to `pointee`
    pub fn byref_of(&mut self, pointee: TypeId) -> TypeId {
        if let Some(&id) = self.byref_index.get(&pointee) {
            return id;
        }
        let name = format!("{}&", self.type_name(pointee));
        let id = self.push_constructed(name, TypeKind::ByRef { pointee });
        self.byref_index.insert(pointee, id);
        id
    }

    /// Get or intern the unmanaged-pointer type to `pointee`
    pub fn pointer_of(&mut self, pointee: TypeId) -> TypeId {
        if let Some(&id) = self.pointer_index.get(&pointee) {
            return id;
        }
        let name = format!("{}*", self.type_name(pointee));
        let id = self.push_constructed(name, TypeKind::Pointer { pointee });
        self.pointer_index.insert(pointee, id);
        id
    }

    /// Get or intern the open generic-parameter type for a slot
    pub fn param_type(&mut self, param: GenericParamRef) -> TypeId {
        if let Some(&id) = self.param_index.get(&param) {
            return id;
        }
        let name = if param.from_method {
            format!("!!{}", param.index)
        } else {
            format!("!{}", param.index)
        };
        let id = self.push_constructed(name, TypeKind::Param(param));
        self.param_index.insert(param, id);
        id
    }

    fn push_constructed(&mut self, name: String, kind: TypeKind) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        let (instance_size, alignment) = match kind {
            TypeKind::ByRef { .. } | TypeKind::Pointer { .. } => {
                (Some(self.pointer_size), self.pointer_size)
            }
            _ => (None, 1),
        };
        self.types.push(TypeDesc {
            id,
            name,
            kind,
            base: None,
            interfaces: Vec::new(),
            fields: Vec::new(),
            generic_def: None,
            generic_args: Vec::new(),
            generic_arity: 0,
            flags: TypeFlags::default(),
            instance_size,
            alignment,
        });
        id
    }

    /// Register a field on `owner`. For explicit-layout owners pass the
    /// declared offset; auto-layout offsets are assigned by
    /// [`finish_layout`](Self::finish_layout).
    pub fn add_field(
        &mut self,
        owner: TypeId,
        name: &str,
        ty: TypeId,
        flags: FieldFlags,
        offset: Option<u32>,
    ) -> FieldId {
        let id = FieldId(self.fields.len() as u32);
        self.fields.push(FieldDesc {
            id,
            name: name.to_string(),
            owner,
            ty,
            offset: offset.unwrap_or(0),
            flags,
        });
        self.types[owner.index()].fields.push(id);
        id
    }

    /// Register a method on `owner`. Virtual methods are assigned the next
    /// free v-table slot of the owner's hierarchy.
    pub fn add_method(
        &mut self,
        owner: TypeId,
        name: &str,
        params: Vec<TypeId>,
        ret: TypeId,
        flags: MethodFlags,
        generic_arity: u16,
    ) -> MethodId {
        let sig = SigDesc {
            params,
            ret,
            has_this: !flags.is_static,
            is_vararg: false,
            generic_arity,
        };
        self.add_method_with_sig(owner, name, sig, flags, generic_arity)
    }

    /// Register a method with a fully-specified signature
    pub fn add_method_with_sig(
        &mut self,
        owner: TypeId,
        name: &str,
        sig: SigDesc,
        flags: MethodFlags,
        generic_arity: u16,
    ) -> MethodId {
        let sig = self.intern_sig(sig);
        let vtable_slot = if flags.is_virtual {
            Some(self.next_vtable_slot(owner))
        } else {
            None
        };
        let id = MethodId(self.methods.len() as u32);
        self.methods.push(MethodDesc {
            id,
            name: name.to_string(),
            owner,
            sig,
            flags,
            generic_def: None,
            generic_args: Vec::new(),
            generic_arity,
            body: None,
            vtable_slot,
        });
        id
    }

    /// Intern a signature by content
    pub fn intern_sig(&mut self, sig: SigDesc) -> SigId {
        if let Some(&id) = self.sig_index.get(&sig) {
            return id;
        }
        let id = SigId(self.sigs.len() as u32);
        self.sigs.push(sig.clone());
        self.sig_index.insert(sig, id);
        id
    }

    fn next_vtable_slot(&self, owner: TypeId) -> u16 {
        let mut count = 0u16;
        let mut cur = Some(owner);
        while let Some(t) = cur {
            let desc = self.type_desc(t);
            count += self
                .methods
                .iter()
                .filter(|m| m.owner == t && m.flags.is_virtual && m.generic_def.is_none())
                .count() as u16;
            cur = desc.base;
        }
        count
    }

    /// Attach a body (token table + locals) to a definition method
    pub fn set_body(
        &mut self,
        method: MethodId,
        tokens: Vec<(u32, TokenEntry)>,
        locals: Vec<TypeId>,
    ) -> BodyId {
        let id = BodyId(self.bodies.len() as u32);
        self.bodies.push(MethodBody {
            id,
            method,
            tokens: tokens.into_iter().collect(),
            strings: FxHashMap::default(),
            locals,
        });
        self.methods[method.index()].body = Some(id);
        id
    }

    /// Register a string-literal token in a body
    pub fn add_body_string(&mut self, body: BodyId, token: u32, value: &str) {
        self.bodies[body.index()]
            .strings
            .insert(token, value.to_string());
    }

    /// The field of `owner` corresponding to a definition field, matched
    /// by declaration position. Identity when `owner` is the definition
    /// itself.
    pub fn corresponding_field(&self, def_field: FieldId, owner: TypeId) -> Option<FieldId> {
        let def_owner = self.field(def_field).owner;
        if def_owner == owner {
            return Some(def_field);
        }
        let pos = self
            .type_desc(def_owner)
            .fields
            .iter()
            .position(|&f| f == def_field)?;
        self.type_desc(owner).fields.get(pos).copied()
    }

    /// Attach image initializer data to an RVA-mapped static field
    pub fn set_rva_data(&mut self, field: FieldId, data: Vec<u8>) {
        self.rva_data.insert(field, data);
    }

    // -------------------------------------------------------------------
    // Layout
    // -------------------------------------------------------------------

    /// Compute field offsets, instance size, and alignment for a type.
    ///
    /// Auto-layout assigns sequential offsets with natural alignment
    /// padding; explicit layout keeps the declared offsets. Statics and
    /// literals do not participate.
    pub fn finish_layout(&mut self, ty: TypeId) -> Result<(), TypeError> {
        if self.contains_param(ty) {
            return Err(TypeError::OpenType {
                name: self.type_name(ty).to_string(),
            });
        }
        let desc = self.type_desc(ty);
        let explicit = desc.flags.explicit_layout;
        let base_size = match desc.base {
            Some(b) if !matches!(self.type_desc(ty).kind, TypeKind::Interface) => {
                self.type_desc(b).instance_size.unwrap_or(0)
            }
            _ => 0,
        };
        let field_ids = desc.fields.clone();

        let mut offset = base_size;
        let mut align = 1u32;
        let mut end = base_size;
        for fid in field_ids {
            let fdesc = self.field(fid);
            if fdesc.flags.is_static || fdesc.flags.is_literal {
                continue;
            }
            let fty = fdesc.ty;
            let (fsize, falign) = self.type_size_align(fty)?;
            align = align.max(falign);
            let foffset = if explicit {
                base_size + fdesc.offset
            } else {
                let padded = (offset + falign - 1) & !(falign - 1);
                offset = padded + fsize;
                padded
            };
            end = end.max(foffset + fsize);
            self.fields[fid.index()].offset = foffset;
        }

        let size = if end == 0 {
            // Empty value types still occupy one byte
            if self.type_desc(ty).is_value_type() {
                1
            } else {
                0
            }
        } else {
            (end + align - 1) & !(align - 1)
        };
        let desc = &mut self.types[ty.index()];
        desc.instance_size = Some(size);
        desc.alignment = align;
        Ok(())
    }

    /// Size and alignment of a type when it appears as a field or element.
    ///
    /// Reference types occupy one pointer; value types use their computed
    /// instance layout.
    pub fn type_size_align(&self, ty: TypeId) -> Result<(u32, u32), TypeError> {
        let desc = self.type_desc(ty);
        match &desc.kind {
            TypeKind::Primitive(PrimitiveKind::Void) => Err(TypeError::NoSize {
                name: desc.name.clone(),
            }),
            TypeKind::Primitive(p) => Ok((p.size(self.pointer_size), p.align(self.pointer_size))),
            TypeKind::ValueType => match desc.instance_size {
                Some(s) => Ok((s, desc.alignment)),
                None => Err(TypeError::NoLayout {
                    name: desc.name.clone(),
                }),
            },
            TypeKind::Param(_) => Err(TypeError::OpenType {
                name: desc.name.clone(),
            }),
            // Classes, interfaces, delegates, arrays, canon: a reference
            TypeKind::Class
            | TypeKind::Interface
            | TypeKind::Delegate
            | TypeKind::Array { .. }
            | TypeKind::Canon => Ok((self.pointer_size, self.pointer_size)),
            TypeKind::ByRef { .. } | TypeKind::Pointer { .. } => {
                Ok((self.pointer_size, self.pointer_size))
            }
        }
    }

    /// All instance fields of a type, inherited first, in layout order
    pub fn instance_fields(&self, ty: TypeId) -> Vec<FieldId> {
        let mut out = Vec::new();
        if let Some(base) = self.type_desc(ty).base {
            out.extend(self.instance_fields(base));
        }
        out.extend(
            self.type_desc(ty)
                .fields
                .iter()
                .copied()
                .filter(|&f| !self.field(f).flags.is_static && !self.field(f).flags.is_literal),
        );
        out
    }

    // -------------------------------------------------------------------
    // Instantiation and substitution
    // -------------------------------------------------------------------

    /// Instantiate a generic type definition with concrete (or canonical)
    /// arguments. Idempotent: equal inputs return the same id.
    pub fn instantiate_type(
        &mut self,
        def: TypeId,
        args: &[TypeId],
    ) -> Result<TypeId, TypeError> {
        let desc = self.type_desc(def);
        if desc.generic_def.is_some() {
            return Err(TypeError::NotGeneric {
                name: desc.name.clone(),
            });
        }
        if desc.generic_arity as usize != args.len() {
            return Err(TypeError::InvalidTypeArgCount {
                name: desc.name.clone(),
                expected: desc.generic_arity as usize,
                actual: args.len(),
            });
        }
        let key = (def, args.to_vec());
        if let Some(&id) = self.inst_type_index.get(&key) {
            return Ok(id);
        }

        let def_desc = self.type_desc(def).clone();
        let arg_names: Vec<String> = args
            .iter()
            .map(|&a| self.type_name(a).to_string())
            .collect();
        let name = format!("{}<{}>", def_desc.name, arg_names.join(", "));

        let id = TypeId(self.types.len() as u32);
        self.types.push(TypeDesc {
            id,
            name,
            kind: def_desc.kind.clone(),
            base: None,       // substituted below
            interfaces: Vec::new(),
            fields: Vec::new(),
            generic_def: Some(def),
            generic_args: args.to_vec(),
            generic_arity: def_desc.generic_arity,
            flags: def_desc.flags,
            instance_size: None,
            alignment: 1,
        });
        self.inst_type_index.insert(key, id);

        let base = match def_desc.base {
            Some(b) => Some(self.substitute(b, args, &[])?),
            None => None,
        };
        let mut interfaces = Vec::with_capacity(def_desc.interfaces.len());
        for &i in &def_desc.interfaces {
            interfaces.push(self.substitute(i, args, &[])?);
        }
        let mut fields = Vec::with_capacity(def_desc.fields.len());
        for &f in &def_desc.fields {
            fields.push(self.instantiate_field(f, id, args)?);
        }
        let desc = &mut self.types[id.index()];
        desc.base = base;
        desc.interfaces = interfaces;
        desc.fields = fields;

        if !self.contains_param(id) {
            self.finish_layout(id)?;
        }
        Ok(id)
    }

    fn instantiate_field(
        &mut self,
        def_field: FieldId,
        owner: TypeId,
        class_args: &[TypeId],
    ) -> Result<FieldId, TypeError> {
        let key = (def_field, owner);
        if let Some(&id) = self.inst_field_index.get(&key) {
            return Ok(id);
        }
        let fdesc = self.field(def_field).clone();
        let ty = self.substitute(fdesc.ty, class_args, &[])?;
        let id = FieldId(self.fields.len() as u32);
        self.fields.push(FieldDesc {
            id,
            name: fdesc.name,
            owner,
            ty,
            offset: fdesc.offset,
            flags: fdesc.flags,
        });
        self.inst_field_index.insert(key, id);
        Ok(id)
    }

    /// Instantiate a method definition on an (instantiated) owner with the
    /// given method-level type arguments. Idempotent.
    pub fn instantiate_method(
        &mut self,
        def: MethodId,
        owner: TypeId,
        method_args: &[TypeId],
    ) -> Result<MethodId, TypeError> {
        let mdesc = self.method(def);
        if mdesc.generic_def.is_some() {
            return Err(TypeError::NotGeneric {
                name: mdesc.name.clone(),
            });
        }
        if mdesc.generic_arity as usize != method_args.len() {
            return Err(TypeError::InvalidTypeArgCount {
                name: mdesc.name.clone(),
                expected: mdesc.generic_arity as usize,
                actual: method_args.len(),
            });
        }
        if owner == mdesc.owner && method_args.is_empty() {
            return Ok(def);
        }
        let key = (def, owner, method_args.to_vec());
        if let Some(&id) = self.inst_method_index.get(&key) {
            return Ok(id);
        }

        let mdesc = self.method(def).clone();
        let class_args = self.type_desc(owner).generic_args.clone();
        let old_sig = self.sig(mdesc.sig).clone();
        let mut params = Vec::with_capacity(old_sig.params.len());
        for &p in &old_sig.params {
            params.push(self.substitute(p, &class_args, method_args)?);
        }
        let ret = self.substitute(old_sig.ret, &class_args, method_args)?;
        let sig = self.intern_sig(SigDesc {
            params,
            ret,
            has_this: old_sig.has_this,
            is_vararg: old_sig.is_vararg,
            generic_arity: old_sig.generic_arity,
        });

        let id = MethodId(self.methods.len() as u32);
        self.methods.push(MethodDesc {
            id,
            name: mdesc.name,
            owner,
            sig,
            flags: mdesc.flags,
            generic_def: Some(def),
            generic_args: method_args.to_vec(),
            generic_arity: mdesc.generic_arity,
            body: mdesc.body,
            vtable_slot: mdesc.vtable_slot,
        });
        self.inst_method_index.insert(key, id);
        Ok(id)
    }

    /// Substitute generic parameters in `ty` with the given arguments.
    ///
    /// Parameters with no corresponding argument are left open, which lets
    /// partial substitution express runtime-determined forms.
    pub fn substitute(
        &mut self,
        ty: TypeId,
        class_args: &[TypeId],
        method_args: &[TypeId],
    ) -> Result<TypeId, TypeError> {
        let desc = self.type_desc(ty).clone();
        match desc.kind {
            TypeKind::Param(p) => {
                let args = if p.from_method { method_args } else { class_args };
                Ok(args.get(p.index as usize).copied().unwrap_or(ty))
            }
            TypeKind::Array { element } => {
                let e = self.substitute(element, class_args, method_args)?;
                Ok(self.array_of(e))
            }
            TypeKind::ByRef { pointee } => {
                let p = self.substitute(pointee, class_args, method_args)?;
                Ok(self.byref_of(p))
            }
            TypeKind::Pointer { pointee } => {
                let p = self.substitute(pointee, class_args, method_args)?;
                Ok(self.pointer_of(p))
            }
            _ if !desc.generic_args.is_empty() => {
                let def = desc.generic_def.expect("instantiation without definition");
                let mut new_args = Vec::with_capacity(desc.generic_args.len());
                for &a in &desc.generic_args {
                    new_args.push(self.substitute(a, class_args, method_args)?);
                }
                self.instantiate_type(def, &new_args)
            }
            _ => Ok(ty),
        }
    }

    // -------------------------------------------------------------------
    // Canonical forms and sharing
    // -------------------------------------------------------------------

    /// Does the type mention the canonical placeholder anywhere?
    pub fn contains_canon(&self, ty: TypeId) -> bool {
        let desc = self.type_desc(ty);
        match &desc.kind {
            TypeKind::Canon => true,
            TypeKind::Array { element } => self.contains_canon(*element),
            TypeKind::ByRef { pointee } | TypeKind::Pointer { pointee } => {
                self.contains_canon(*pointee)
            }
            _ => desc.generic_args.iter().any(|&a| self.contains_canon(a)),
        }
    }

    /// Does the type mention an open generic parameter anywhere?
    pub fn contains_param(&self, ty: TypeId) -> bool {
        let desc = self.type_desc(ty);
        match &desc.kind {
            TypeKind::Param(_) => true,
            TypeKind::Array { element } => self.contains_param(*element),
            TypeKind::ByRef { pointee } | TypeKind::Pointer { pointee } => {
                self.contains_param(*pointee)
            }
            _ => desc.generic_args.iter().any(|&a| self.contains_param(a)),
        }
    }

    /// A type is concrete when it is neither open nor canonically shared
    pub fn is_concrete(&self, ty: TypeId) -> bool {
        !self.contains_canon(ty) && !self.contains_param(ty)
    }

    /// Is the type a garbage-collected reference when used as a value?
    pub fn is_reference_type(&self, ty: TypeId) -> bool {
        matches!(
            self.type_desc(ty).kind,
            TypeKind::Class
                | TypeKind::Interface
                | TypeKind::Delegate
                | TypeKind::Array { .. }
                | TypeKind::Canon
        )
    }

    /// Does a method instantiation share code with other instantiations
    /// (i.e. any of its type or method arguments is canonical)?
    pub fn is_shared_method(&self, m: MethodId) -> bool {
        let mdesc = self.method(m);
        self.contains_canon(mdesc.owner)
            || mdesc.generic_args.iter().any(|&a| self.contains_canon(a))
    }

    fn canonical_arg(&mut self, arg: TypeId) -> Result<TypeId, TypeError> {
        if self.is_reference_type(arg) {
            Ok(self.well_known.canon)
        } else {
            self.canonical_type(arg)
        }
    }

    /// The canonical form of a type: every reference-type argument replaced
    /// with the placeholder, recursively.
    pub fn canonical_type(&mut self, ty: TypeId) -> Result<TypeId, TypeError> {
        let desc = self.type_desc(ty).clone();
        match desc.kind {
            TypeKind::Array { element } => {
                let e = self.canonical_arg(element)?;
                Ok(self.array_of(e))
            }
            _ if !desc.generic_args.is_empty() => {
                let def = desc.generic_def.expect("instantiation without definition");
                let mut args = Vec::with_capacity(desc.generic_args.len());
                for &a in &desc.generic_args {
                    args.push(self.canonical_arg(a)?);
                }
                self.instantiate_type(def, &args)
            }
            _ => Ok(ty),
        }
    }

    /// The canonical form of a method: canonical owner, canonical method
    /// arguments.
    pub fn canonical_method(&mut self, m: MethodId) -> Result<MethodId, TypeError> {
        let mdesc = self.method(m).clone();
        let owner_c = self.canonical_type(mdesc.owner)?;
        let mut args_c = Vec::with_capacity(mdesc.generic_args.len());
        for &a in &mdesc.generic_args {
            args_c.push(self.canonical_arg(a)?);
        }
        let def = mdesc.generic_def.unwrap_or(m);
        if owner_c == mdesc.owner && args_c == mdesc.generic_args {
            return Ok(m);
        }
        self.instantiate_method(def, owner_c, &args_c)
    }

    // -------------------------------------------------------------------
    // Relations (concrete reference answers)
    // -------------------------------------------------------------------

    /// Transitive interface closure of a type (own, inherited, and
    /// interface-extended)
    pub fn interface_closure(&self, ty: TypeId) -> Vec<TypeId> {
        let mut out = Vec::new();
        let mut stack = vec![ty];
        while let Some(t) = stack.pop() {
            let desc = self.type_desc(t);
            for &i in &desc.interfaces {
                if !out.contains(&i) {
                    out.push(i);
                    stack.push(i);
                }
            }
            if let Some(b) = desc.base {
                stack.push(b);
            }
        }
        out
    }

    /// The real subtype relation for fully concrete types.
    ///
    /// Value types relate only to themselves (boxing is a separate
    /// conversion, not a subtype fact). Arrays are covariant over
    /// reference elements.
    pub fn is_subtype_of(&self, sub: TypeId, sup: TypeId) -> bool {
        if sub == sup {
            return true;
        }
        let sub_desc = self.type_desc(sub);
        let sup_desc = self.type_desc(sup);
        if sub_desc.is_value_type() || sup_desc.is_value_type() {
            return false;
        }
        if let (TypeKind::Array { element: e1 }, TypeKind::Array { element: e2 }) =
            (&sub_desc.kind, &sup_desc.kind)
        {
            return self.is_reference_type(*e1)
                && self.is_reference_type(*e2)
                && self.is_subtype_of(*e1, *e2);
        }
        if sup_desc.is_interface() {
            return self.interface_closure(sub).contains(&sup);
        }
        // Walk the base-class chain
        let mut cur = sub_desc.base;
        while let Some(t) = cur {
            if t == sup {
                return true;
            }
            cur = self.type_desc(t).base;
        }
        false
    }

    // -------------------------------------------------------------------
    // Provider queries
    // -------------------------------------------------------------------

    /// The body of a method; instantiations resolve to their definition's
    /// body.
    pub fn method_body(&self, m: MethodId) -> Option<&MethodBody> {
        self.method(m).body.map(|b| self.body(b))
    }

    /// True when static initialization must be triggered lazily at first
    /// static access rather than at some point before it.
    pub fn has_lazy_static_init(&self, ty: TypeId) -> bool {
        let flags = self.type_desc(ty).flags;
        flags.has_cctor && !flags.before_field_init
    }

    /// A type no subtype of which can exist: sealed classes, value types,
    /// and arrays.
    pub fn is_effectively_sealed(&self, ty: TypeId) -> bool {
        let desc = self.type_desc(ty);
        desc.flags.is_sealed || desc.is_value_type() || desc.is_array()
    }

    /// A method that can never be overridden at runtime
    pub fn is_effectively_final(&self, m: MethodId) -> bool {
        let mdesc = self.method(m);
        !mdesc.flags.is_virtual
            || mdesc.flags.is_final
            || self.is_effectively_sealed(mdesc.owner)
    }

    /// Image initializer data for an RVA-mapped static field
    pub fn field_rva_data(&self, f: FieldId) -> Option<&[u8]> {
        self.rva_data.get(&f).map(|v| v.as_slice())
    }

    /// First method declared directly on `owner` matching a name and
    /// parameter count. Used for approximate constrained-call resolution.
    pub fn find_method_matching(
        &self,
        owner: TypeId,
        name: &str,
        param_count: usize,
    ) -> Option<MethodId> {
        self.methods
            .iter()
            .find(|m| {
                m.owner == owner
                    && m.name == name
                    && self.sig(m.sig).params.len() == param_count
            })
            .map(|m| m.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MetadataStore {
        MetadataStore::new(8)
    }

    #[test]
    fn test_well_known_types() {
        let s = store();
        let wk = *s.well_known();
        assert_eq!(s.type_name(wk.object), "Object");
        assert_eq!(s.type_name(wk.string), "String");
        assert!(s.type_desc(wk.string).flags.is_sealed);
        assert!(matches!(s.type_desc(wk.canon).kind, TypeKind::Canon));
        assert_eq!(s.type_desc(wk.runtime_type_handle).instance_size, Some(8));
    }

    #[test]
    fn test_primitive_interning() {
        let mut s = store();
        let a = s.primitive(PrimitiveKind::I32);
        let b = s.primitive(PrimitiveKind::I32);
        assert_eq!(a, b);
        assert_eq!(s.type_size_align(a).unwrap(), (4, 4));
    }

    #[test]
    fn test_constructed_interning() {
        let mut s = store();
        let i32t = s.primitive(PrimitiveKind::I32);
        let arr = s.array_of(i32t);
        let byref = s.byref_of(i32t);
        assert_eq!(s.array_of(i32t), arr);
        assert_eq!(s.byref_of(i32t), byref);
        assert_ne!(arr, byref);
        assert_eq!(s.type_name(arr), "Int32[]");
    }

    #[test]
    fn test_auto_layout() {
        let mut s = store();
        let i8t = s.primitive(PrimitiveKind::I8);
        let i32t = s.primitive(PrimitiveKind::I32);
        let vt = s.define_type(TypeSpec {
            name: "Pair".to_string(),
            kind: TypeKind::ValueType,
            base: None,
            interfaces: vec![],
            generic_arity: 0,
            flags: TypeFlags::default(),
        });
        let f1 = s.add_field(vt, "a", i8t, FieldFlags::default(), None);
        let f2 = s.add_field(vt, "b", i32t, FieldFlags::default(), None);
        s.finish_layout(vt).unwrap();

        assert_eq!(s.field(f1).offset, 0);
        // Padded to the alignment of Int32
        assert_eq!(s.field(f2).offset, 4);
        assert_eq!(s.type_desc(vt).instance_size, Some(8));
        assert_eq!(s.type_desc(vt).alignment, 4);
    }

    #[test]
    fn test_instantiation_interning_and_substitution() {
        let mut s = store();
        let object = s.well_known().object;
        let i32t = s.primitive(PrimitiveKind::I32);
        let list = s.define_type(TypeSpec {
            name: "List".to_string(),
            kind: TypeKind::Class,
            base: Some(object),
            interfaces: vec![],
            generic_arity: 1,
            flags: TypeFlags::default(),
        });
        let t0 = s.param_type(GenericParamRef {
            index: 0,
            from_method: false,
        });
        let items = s.array_of(t0);
        s.add_field(list, "_items", items, FieldFlags::default(), None);

        let list_i32 = s.instantiate_type(list, &[i32t]).unwrap();
        let again = s.instantiate_type(list, &[i32t]).unwrap();
        assert_eq!(list_i32, again);
        assert_eq!(s.type_name(list_i32), "List<Int32>");

        // The field type was substituted to Int32[]
        let fields = s.instance_fields(list_i32);
        assert_eq!(fields.len(), 1);
        let fty = s.field(fields[0]).ty;
        assert_eq!(s.type_name(fty), "Int32[]");
    }

    #[test]
    fn test_canonical_form() {
        let mut s = store();
        let object = s.well_known().object;
        let string = s.well_known().string;
        let canon = s.well_known().canon;
        let i32t = s.primitive(PrimitiveKind::I32);
        let dict = s.define_type(TypeSpec {
            name: "Dict".to_string(),
            kind: TypeKind::Class,
            base: Some(object),
            interfaces: vec![],
            generic_arity: 2,
            flags: TypeFlags::default(),
        });

        let dict_str_i32 = s.instantiate_type(dict, &[string, i32t]).unwrap();
        let c = s.canonical_type(dict_str_i32).unwrap();
        let expected = s.instantiate_type(dict, &[canon, i32t]).unwrap();
        assert_eq!(c, expected);
        assert!(s.contains_canon(c));
        assert!(!s.contains_canon(dict_str_i32));
    }

    #[test]
    fn test_subtyping() {
        let mut s = store();
        let object = s.well_known().object;
        let string = s.well_known().string;
        let iface = s.define_type(TypeSpec {
            name: "IThing".to_string(),
            kind: TypeKind::Interface,
            base: None,
            interfaces: vec![],
            generic_arity: 0,
            flags: TypeFlags {
                is_abstract: true,
                ..TypeFlags::default()
            },
        });
        let thing = s.define_type(TypeSpec {
            name: "Thing".to_string(),
            kind: TypeKind::Class,
            base: Some(object),
            interfaces: vec![iface],
            generic_arity: 0,
            flags: TypeFlags::default(),
        });

        assert!(s.is_subtype_of(string, object));
        assert!(s.is_subtype_of(thing, iface));
        assert!(!s.is_subtype_of(object, string));

        // Array covariance over reference elements
        let str_arr = s.array_of(string);
        let obj_arr = s.array_of(object);
        assert!(s.is_subtype_of(str_arr, obj_arr));
        assert!(!s.is_subtype_of(obj_arr, str_arr));

        // Value types relate only to themselves
        let i32t = s.primitive(PrimitiveKind::I32);
        assert!(!s.is_subtype_of(i32t, object));
        assert!(s.is_subtype_of(i32t, i32t));
    }

    #[test]
    fn test_effectively_sealed_and_final() {
        let mut s = store();
        let object = s.well_known().object;
        let i32t = s.primitive(PrimitiveKind::I32);
        assert!(s.is_effectively_sealed(s.well_known().string));
        assert!(s.is_effectively_sealed(i32t));
        assert!(!s.is_effectively_sealed(object));

        let void = s.primitive(PrimitiveKind::Void);
        let m = s.add_method(
            object,
            "NonVirtual",
            vec![],
            void,
            MethodFlags::default(),
            0,
        );
        assert!(s.is_effectively_final(m));
        let v = s.add_method(
            object,
            "Virtual",
            vec![],
            void,
            MethodFlags {
                is_virtual: true,
                ..MethodFlags::default()
            },
            0,
        );
        assert!(!s.is_effectively_final(v));
    }

    #[test]
    fn test_rva_data() {
        let mut s = store();
        let i32t = s.primitive(PrimitiveKind::I32);
        let object = s.well_known().object;
        let f = s.add_field(
            object,
            "Table",
            i32t,
            FieldFlags {
                is_static: true,
                has_rva: true,
                ..FieldFlags::default()
            },
            None,
        );
        assert!(s.field_rva_data(f).is_none());
        s.set_rva_data(f, vec![1, 2, 3, 4]);
        assert_eq!(s.field_rva_data(f), Some(&[1u8, 2, 3, 4][..]));
    }
}
