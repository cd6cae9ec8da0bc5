use std::rc::Rc;

use super::decl::FunctionDeclareNode;
use super::types::ValueType;
use super::value::Value;

/// Kind tag of an object member. Runtime dispatch is by this tag, never by
/// a class hierarchy of member node types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberKind {
    Field,
    Method,
    Accessor,
}

/// A single member of an object description, in source order.
#[derive(Clone, Debug)]
pub struct ObjectMember {
    pub name: String,
    pub kind: MemberKind,
    pub value_type: ValueType,
    pub is_static: bool,
    /// Declared on this description itself, as opposed to inherited from
    /// the base. Inherited members still appear in `members`, first and in
    /// base order, so index formulas work on the flat list.
    pub is_own: bool,
    pub has_getter: bool,
    pub has_setter: bool,
    /// Body of the method, or of the overriding implementation for an
    /// inherited member; `None` for interface members
    pub method: Option<Rc<FunctionDeclareNode>>,
    pub getter: Option<Rc<FunctionDeclareNode>>,
    pub setter: Option<Rc<FunctionDeclareNode>>,
    /// Declared initializer for static fields, evaluated at module start
    pub static_init: Option<Value>,
}

impl ObjectMember {
    pub fn field(name: impl Into<String>, value_type: ValueType) -> Self {
        ObjectMember {
            name: name.into(),
            kind: MemberKind::Field,
            value_type,
            is_static: false,
            is_own: true,
            has_getter: false,
            has_setter: false,
            method: None,
            getter: None,
            setter: None,
            static_init: None,
        }
    }

    pub fn method(
        name: impl Into<String>,
        value_type: ValueType,
        decl: Rc<FunctionDeclareNode>,
    ) -> Self {
        ObjectMember {
            name: name.into(),
            kind: MemberKind::Method,
            value_type,
            is_static: false,
            is_own: true,
            has_getter: false,
            has_setter: false,
            method: Some(decl),
            getter: None,
            setter: None,
            static_init: None,
        }
    }

    /// Interface members carry no bodies.
    pub fn abstract_method(name: impl Into<String>, value_type: ValueType) -> Self {
        ObjectMember {
            name: name.into(),
            kind: MemberKind::Method,
            value_type,
            is_static: false,
            is_own: true,
            has_getter: false,
            has_setter: false,
            method: None,
            getter: None,
            setter: None,
            static_init: None,
        }
    }

    /// Number of vtable slots this member occupies.
    fn vtable_slots(&self) -> usize {
        match self.kind {
            MemberKind::Field => 0,
            MemberKind::Method => 1,
            MemberKind::Accessor => self.has_getter as usize + self.has_setter as usize,
        }
    }
}

/// Which slot of an accessor pair an access targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Method,
    Getter,
    Setter,
}

/// The language-level declaration of a class or interface: ordered members,
/// optional base, optional constructor. Descriptions with `is_interface`
/// have no concrete storage but still induce a shape layout used by the
/// interface fast path.
#[derive(Clone, Debug)]
pub struct ObjectDescription {
    pub name: String,
    /// Unique id assigned by the upstream resolver
    pub type_id: u32,
    pub is_interface: bool,
    /// All members, inherited first in base order, then own members in
    /// source order
    pub members: Vec<ObjectMember>,
    pub base: Option<Rc<ObjectDescription>>,
    pub ctor: Option<Rc<FunctionDeclareNode>>,
}

impl ObjectDescription {
    pub fn member(&self, name: &str) -> Option<&ObjectMember> {
        self.members.iter().find(|m| m.name == name)
    }

    /// Position of a non-static field in the emitted struct, counted among
    /// non-static `Field` members with an earlier source index. The wasm
    /// struct slot is `1 + field_index` (slot 0 is the vtable).
    ///
    /// The indices carried by the semantics tree are intentionally ignored;
    /// these formulas are the only source of truth.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        let mut index = 0;
        for member in &self.members {
            if member.is_static || member.kind != MemberKind::Field {
                continue;
            }
            if member.name == name {
                return Some(index);
            }
            index += 1;
        }
        None
    }

    /// Same as [`field_index`](Self::field_index), restricted to statics.
    pub fn static_field_index(&self, name: &str) -> Option<usize> {
        let mut index = 0;
        for member in &self.members {
            if !member.is_static || member.kind != MemberKind::Field {
                continue;
            }
            if member.name == name {
                return Some(index);
            }
            index += 1;
        }
        None
    }

    /// Vtable slot of a method or accessor. Accessor pairs occupy two
    /// consecutive slots, getter first; a setter access advances one past
    /// its paired getter.
    pub fn vtable_index(&self, name: &str, access: AccessKind) -> Option<usize> {
        let mut slot = 0;
        for member in &self.members {
            if member.is_static || member.kind == MemberKind::Field {
                continue;
            }
            if member.name == name {
                return match access {
                    AccessKind::Method | AccessKind::Getter => Some(slot),
                    AccessKind::Setter => Some(slot + member.has_getter as usize),
                };
            }
            slot += member.vtable_slots();
        }
        None
    }

    /// Total number of vtable slots, accessor pairs expanded.
    pub fn vtable_slot_count(&self) -> usize {
        self.members
            .iter()
            .filter(|m| !m.is_static)
            .map(ObjectMember::vtable_slots)
            .sum()
    }

    pub fn has_static_fields(&self) -> bool {
        self.members
            .iter()
            .any(|m| m.is_static && m.kind == MemberKind::Field)
    }

    /// Walk the base chain (starting at `self`) for the description that
    /// declares `name` as its own member.
    pub fn owner_of(self: &Rc<Self>, name: &str) -> Option<Rc<ObjectDescription>> {
        let mut cur = Some(Rc::clone(self));
        while let Some(meta) = cur {
            if meta.members.iter().any(|m| m.name == name && m.is_own) {
                return Some(meta);
            }
            cur = meta.base.clone();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accessor(name: &str, getter: bool, setter: bool) -> ObjectMember {
        ObjectMember {
            name: name.into(),
            kind: MemberKind::Accessor,
            value_type: ValueType::Number,
            is_static: false,
            is_own: true,
            has_getter: getter,
            has_setter: setter,
            method: None,
            getter: None,
            setter: None,
            static_init: None,
        }
    }

    fn description(members: Vec<ObjectMember>) -> ObjectDescription {
        ObjectDescription {
            name: "T".into(),
            type_id: 100,
            is_interface: false,
            members,
            base: None,
            ctor: None,
        }
    }

    #[test]
    fn test_field_index_skips_statics_and_methods() {
        let mut stat = ObjectMember::field("s", ValueType::Number);
        stat.is_static = true;
        let meta = description(vec![
            ObjectMember::field("a", ValueType::Number),
            stat,
            ObjectMember::abstract_method("m", ValueType::Number),
            ObjectMember::field("b", ValueType::String),
        ]);
        assert_eq!(meta.field_index("a"), Some(0));
        assert_eq!(meta.field_index("b"), Some(1));
        assert_eq!(meta.field_index("s"), None);
        assert_eq!(meta.static_field_index("s"), Some(0));
    }

    #[test]
    fn test_vtable_index_expands_accessor_pairs() {
        let meta = description(vec![
            ObjectMember::abstract_method("m", ValueType::Number),
            accessor("x", true, true),
            ObjectMember::abstract_method("n", ValueType::Number),
            accessor("y", true, false),
        ]);
        assert_eq!(meta.vtable_index("m", AccessKind::Method), Some(0));
        assert_eq!(meta.vtable_index("x", AccessKind::Getter), Some(1));
        assert_eq!(meta.vtable_index("x", AccessKind::Setter), Some(2));
        assert_eq!(meta.vtable_index("n", AccessKind::Method), Some(3));
        assert_eq!(meta.vtable_index("y", AccessKind::Getter), Some(4));
        assert_eq!(meta.vtable_slot_count(), 5);
    }

    #[test]
    fn test_indices_agree_with_base_concatenation() {
        // Indices computed over the flat list must match the ones derived
        // from base ++ own-members concatenation.
        let base_members = vec![
            ObjectMember::field("a", ValueType::Number),
            ObjectMember::abstract_method("m", ValueType::Number),
        ];
        let own_members = vec![
            ObjectMember::field("b", ValueType::String),
            accessor("x", true, true),
        ];

        let base = description(base_members.clone());
        let mut inherited = base_members;
        for m in &mut inherited {
            m.is_own = false;
        }
        let mut all = inherited;
        all.extend(own_members);
        let derived = description(all);

        assert_eq!(derived.field_index("a"), base.field_index("a"));
        assert_eq!(derived.vtable_index("m", AccessKind::Method), Some(0));
        assert_eq!(derived.field_index("b"), Some(1));
        assert_eq!(derived.vtable_index("x", AccessKind::Getter), Some(1));
        assert_eq!(derived.vtable_index("x", AccessKind::Setter), Some(2));
    }
}
