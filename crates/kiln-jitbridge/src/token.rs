//! Token resolution, including runtime-determined forms
//!
//! A method body refers to other entities through scoped tokens. Bodies
//! are stored once per definition, so token entries are in the
//! definition's open form (members of a generic owner hang off the
//! parameter-instantiated owner, e.g. `Repo<!0>`). Resolving a token
//! instantiates the entry with the compiled method's actual type and
//! method arguments.
//!
//! For a canonically-shared method the resolver additionally computes the
//! **runtime-determined** form: the same entry re-instantiated with
//! arguments where every canonical slot stays a generic parameter.
//! Dependency tracking and dictionary-lookup computation operate on that
//! identity rather than on the canonical placeholder.

use rustc_hash::FxHashMap;

use kiln_types::{BodyId, Entity, GenericParamRef, MetadataStore, MethodId, TypeId};

use crate::error::CompileError;

/// A resolved (scope, token) pair with its cached resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedToken {
    pub scope: BodyId,
    pub token: u32,
    /// The resolution in the compiled method's actual (possibly
    /// canonical) instantiation
    pub entity: Entity,
    /// The runtime-determined form; equals `entity` when the compiled
    /// method is not shared
    pub runtime_entity: Entity,
}

/// Per-compilation token resolver.
///
/// Cached by (context, token): a body is shared between a definition's
/// instantiations, so the body id alone does not identify a resolution.
pub struct TokenResolver {
    cache: FxHashMap<(MethodId, u32), ResolvedToken>,
}

impl TokenResolver {
    pub fn new() -> Self {
        TokenResolver {
            cache: FxHashMap::default(),
        }
    }

    /// Resolve a token of `context`'s body.
    ///
    /// Fails with [`CompileError::MissingMember`] for literal fields
    /// (they have no runtime storage) and with
    /// [`CompileError::InvalidProgram`] for tokens that do not exist in
    /// the body's table.
    pub fn resolve(
        &mut self,
        store: &mut MetadataStore,
        context: MethodId,
        token: u32,
    ) -> Result<ResolvedToken, CompileError> {
        let mdesc = store.method(context).clone();
        let body = store.method_body(context).ok_or_else(|| {
            CompileError::InvalidProgram {
                method: store.entity_name(Entity::Method(context)),
                reason: "method has no body".to_string(),
            }
        })?;
        let scope = body.id;
        if let Some(&cached) = self.cache.get(&(context, token)) {
            return Ok(cached);
        }
        let entry = body.tokens.get(&token).copied().ok_or_else(|| {
            CompileError::InvalidProgram {
                method: store.entity_name(Entity::Method(context)),
                reason: format!("unresolvable token {token:#010x}"),
            }
        })?;

        if let Entity::Field(f) = entry.entity {
            if store.field(f).flags.is_literal {
                return Err(CompileError::MissingMember {
                    name: store.entity_name(entry.entity),
                });
            }
        }

        let class_args = store.type_desc(mdesc.owner).generic_args.clone();
        let method_args = mdesc.generic_args.clone();

        let mut entity = instantiate_entity(store, entry.entity, &class_args, &method_args)?;
        if entry.as_array {
            entity = promote_to_array(store, entity, context)?;
        }

        let runtime_entity = if store.is_shared_method(context) {
            let rt_class = runtime_determined_args(store, &class_args, false);
            let rt_method = runtime_determined_args(store, &method_args, true);
            let mut rt = instantiate_entity(store, entry.entity, &rt_class, &rt_method)?;
            if entry.as_array {
                rt = promote_to_array(store, rt, context)?;
            }
            rt
        } else {
            entity
        };

        let resolved = ResolvedToken {
            scope,
            token,
            entity,
            runtime_entity,
        };
        self.cache.insert((context, token), resolved);
        Ok(resolved)
    }

    /// Drop all cached resolutions
    pub fn reset(&mut self) {
        self.cache.clear();
    }
}

impl Default for TokenResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn promote_to_array(
    store: &mut MetadataStore,
    entity: Entity,
    context: MethodId,
) -> Result<Entity, CompileError> {
    match entity {
        Entity::Type(t) => {
            if matches!(
                store.type_desc(t).kind,
                kiln_types::TypeKind::Primitive(kiln_types::PrimitiveKind::Void)
            ) {
                return Err(CompileError::InvalidProgram {
                    method: store.entity_name(Entity::Method(context)),
                    reason: "array of void".to_string(),
                });
            }
            Ok(Entity::Type(store.array_of(t)))
        }
        other => Err(CompileError::InvalidProgram {
            method: store.entity_name(Entity::Method(context)),
            reason: format!("array token names a {}", other.kind_name()),
        }),
    }
}

/// Arguments for the runtime-determined form: canonical slots stay open
/// parameters, concrete slots keep their argument.
fn runtime_determined_args(
    store: &mut MetadataStore,
    args: &[TypeId],
    from_method: bool,
) -> Vec<TypeId> {
    args.iter()
        .enumerate()
        .map(|(i, &a)| {
            if store.contains_canon(a) {
                store.param_type(GenericParamRef {
                    index: i as u16,
                    from_method,
                })
            } else {
                a
            }
        })
        .collect()
}

/// Instantiate any entity with the given type/method arguments
pub fn instantiate_entity(
    store: &mut MetadataStore,
    entity: Entity,
    class_args: &[TypeId],
    method_args: &[TypeId],
) -> Result<Entity, CompileError> {
    match entity {
        Entity::Type(t) => Ok(Entity::Type(store.substitute(t, class_args, method_args)?)),
        Entity::Method(m) => {
            let mdesc = store.method(m).clone();
            let owner = store.substitute(mdesc.owner, class_args, method_args)?;
            let mut args = Vec::with_capacity(mdesc.generic_args.len());
            for &a in &mdesc.generic_args {
                args.push(store.substitute(a, class_args, method_args)?);
            }
            if owner == mdesc.owner && args == mdesc.generic_args {
                return Ok(entity);
            }
            let def = mdesc.generic_def.unwrap_or(m);
            Ok(Entity::Method(store.instantiate_method(def, owner, &args)?))
        }
        Entity::Field(f) => {
            let fdesc_owner = store.field(f).owner;
            let owner = store.substitute(fdesc_owner, class_args, method_args)?;
            if owner == fdesc_owner {
                return Ok(entity);
            }
            let mapped = store.corresponding_field(f, owner).ok_or_else(|| {
                CompileError::MissingMember {
                    name: store.entity_name(entity),
                }
            })?;
            Ok(Entity::Field(mapped))
        }
        Entity::Signature(_) | Entity::Locals(_) => Ok(entity),
    }
}
