use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use crate::descriptor::{self, TypeCategory};
use crate::error::{CpError, malformed_ir};
use crate::ir::{
    ControlFlowGraph, EncodedValue, FieldRef, Instruction, InvokeKind, Method, MethodRef, Program,
};
use crate::lattice::ConstantValue;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct ClassId(pub(crate) u32);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct MethodId(pub(crate) u32);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct FieldId(pub(crate) u32);

/// Interned string or type literal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct Symbol(pub(crate) u32);

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// Virtual methods of `java/lang/Object` that any class may override.
const OBJECT_VIRTUALS: [(&str, &str); 5] = [
    ("equals", "(Ljava/lang/Object;)Z"),
    ("hashCode", "()I"),
    ("toString", "()Ljava/lang/String;"),
    ("finalize", "()V"),
    ("clone", "()Ljava/lang/Object;"),
];

const JAVA_LANG_OBJECT: &str = "java/lang/Object";

#[derive(Clone, Debug)]
pub(crate) struct ClassInfo {
    pub(crate) name: String,
    pub(crate) super_class: Option<ClassId>,
    /// Super type or interface named by the class but not defined in the program.
    pub(crate) has_external_parent: bool,
    pub(crate) interfaces: Vec<ClassId>,
    pub(crate) children: Vec<ClassId>,
    pub(crate) is_enum: bool,
    pub(crate) is_interface: bool,
    pub(crate) keep: bool,
    pub(crate) has_native_method: bool,
    pub(crate) methods: Vec<MethodId>,
    pub(crate) fields: Vec<FieldId>,
    pub(crate) clinit: Option<MethodId>,
}

#[derive(Clone, Debug)]
pub(crate) struct MethodInfo {
    pub(crate) class: ClassId,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) params: Vec<TypeCategory>,
    pub(crate) returns: TypeCategory,
    pub(crate) is_static: bool,
    pub(crate) is_private: bool,
    pub(crate) is_native: bool,
    pub(crate) is_abstract: bool,
    pub(crate) keep: bool,
    position: (usize, usize),
}

impl MethodInfo {
    pub(crate) fn is_clinit(&self) -> bool {
        self.name == "<clinit>"
    }

    pub(crate) fn is_init(&self) -> bool {
        self.name == "<init>"
    }

    /// Dispatched through a vtable, so overrides may run instead.
    pub(crate) fn is_virtual(&self) -> bool {
        !self.is_static && !self.is_private && !self.is_init() && !self.is_clinit()
    }

    /// Class and method offsets of the definition inside the program.
    pub(crate) fn position(&self) -> (usize, usize) {
        self.position
    }
}

#[derive(Clone, Debug)]
pub(crate) struct FieldInfo {
    pub(crate) class: ClassId,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) category: TypeCategory,
    pub(crate) is_static: bool,
    pub(crate) keep: bool,
    pub(crate) encoded_value: Option<EncodedValue>,
    /// Value before any initialiser runs: the constant-table entry or zero.
    pub(crate) initial_value: ConstantValue,
}

/// Read-only string/type intern table.
#[derive(Clone, Debug, Default)]
pub(crate) struct Interner {
    symbols: BTreeMap<String, Symbol>,
    texts: Vec<String>,
}

impl Interner {
    fn intern(&mut self, text: &str) -> Symbol {
        if let Some(symbol) = self.symbols.get(text) {
            return *symbol;
        }
        let symbol = Symbol(self.texts.len() as u32);
        self.texts.push(text.to_string());
        self.symbols.insert(text.to_string(), symbol);
        symbol
    }

    pub(crate) fn lookup(&self, text: &str) -> Option<Symbol> {
        self.symbols.get(text).copied()
    }

    pub(crate) fn text(&self, symbol: Symbol) -> &str {
        self.texts
            .get(symbol.0 as usize)
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Arena view of the program's class hierarchy, shared read-only by every
/// analysis phase.
#[derive(Clone, Debug)]
pub(crate) struct ProgramIndex {
    classes: Vec<ClassInfo>,
    methods: Vec<MethodInfo>,
    fields: Vec<FieldInfo>,
    class_by_name: BTreeMap<String, ClassId>,
    overrides: Vec<Vec<MethodId>>,
    overrides_external: Vec<bool>,
    writers: Vec<BTreeSet<MethodId>>,
    strings: Interner,
}

impl ProgramIndex {
    pub(crate) fn build(program: &Program) -> Result<Self, CpError> {
        let mut class_by_name = BTreeMap::new();
        for (index, class) in program.classes.iter().enumerate() {
            if class_by_name
                .insert(class.name.clone(), ClassId(index as u32))
                .is_some()
            {
                return Err(malformed_ir!("duplicate class {}", class.name));
            }
        }

        let mut classes = Vec::with_capacity(program.classes.len());
        let mut methods = Vec::new();
        let mut fields = Vec::new();
        let mut strings = Interner::default();
        for (class_index, class) in program.classes.iter().enumerate() {
            let id = ClassId(class_index as u32);
            let super_class = class
                .super_name
                .as_ref()
                .and_then(|name| class_by_name.get(name).copied());
            let interfaces: Vec<ClassId> = class
                .interfaces
                .iter()
                .filter_map(|name| class_by_name.get(name).copied())
                .collect();
            let has_external_parent = class
                .super_name
                .iter()
                .chain(class.interfaces.iter())
                .any(|name| name != JAVA_LANG_OBJECT && !class_by_name.contains_key(name));

            let mut info = ClassInfo {
                name: class.name.clone(),
                super_class,
                has_external_parent,
                interfaces,
                children: Vec::new(),
                is_enum: class.access.is_enum,
                is_interface: class.access.is_interface,
                keep: class.access.keep,
                has_native_method: false,
                methods: Vec::new(),
                fields: Vec::new(),
                clinit: None,
            };

            let mut seen_methods = BTreeSet::new();
            for (method_index, method) in class.methods.iter().enumerate() {
                if !seen_methods.insert((method.name.as_str(), method.descriptor.as_str())) {
                    return Err(malformed_ir!(
                        "duplicate method {}.{}{}",
                        class.name,
                        method.name,
                        method.descriptor
                    ));
                }
                let method_id = MethodId(methods.len() as u32);
                methods.push(method_info(id, class_index, method_index, &class.name, method)?);
                info.has_native_method |= method.access.is_native;
                if method.is_clinit() {
                    info.clinit = Some(method_id);
                }
                info.methods.push(method_id);
                if let Some(cfg) = &method.code {
                    intern_literals(cfg, &mut strings);
                }
            }

            for field in &class.fields {
                let category = descriptor::field_category(&field.descriptor).map_err(|error| {
                    malformed_ir!("field {}.{}: {:#}", class.name, field.name, error)
                })?;
                let initial_value = match &field.encoded_value {
                    None | Some(EncodedValue::Null) => ConstantValue::of_int(0),
                    Some(EncodedValue::Int(value)) => ConstantValue::of_encoded(*value)?,
                    Some(EncodedValue::String(text)) => ConstantValue::of_string(strings.intern(text)),
                    Some(EncodedValue::Class(text)) => ConstantValue::of_class(strings.intern(text)),
                };
                info.fields.push(FieldId(fields.len() as u32));
                fields.push(FieldInfo {
                    class: id,
                    name: field.name.clone(),
                    descriptor: field.descriptor.clone(),
                    category,
                    is_static: field.access.is_static,
                    keep: field.access.keep,
                    encoded_value: field.encoded_value.clone(),
                    initial_value,
                });
            }
            classes.push(info);
        }

        reject_inheritance_cycles(&classes)?;
        for index in 0..classes.len() {
            let child = ClassId(index as u32);
            let parents: Vec<ClassId> = classes[index]
                .super_class
                .iter()
                .chain(classes[index].interfaces.iter())
                .copied()
                .collect();
            for parent in parents {
                classes[parent.0 as usize].children.push(child);
            }
        }

        let mut index = Self {
            classes,
            methods,
            fields,
            class_by_name,
            overrides: Vec::new(),
            overrides_external: Vec::new(),
            writers: Vec::new(),
            strings,
        };
        index.overrides = (0..index.methods.len())
            .map(|method| index.compute_overrides(MethodId(method as u32)))
            .collect();
        index.overrides_external = (0..index.methods.len())
            .map(|method| index.compute_overrides_external(MethodId(method as u32)))
            .collect();
        index.writers = index.compute_writers(program);
        Ok(index)
    }

    pub(crate) fn class(&self, id: ClassId) -> &ClassInfo {
        &self.classes[id.0 as usize]
    }

    pub(crate) fn method(&self, id: MethodId) -> &MethodInfo {
        &self.methods[id.0 as usize]
    }

    pub(crate) fn field(&self, id: FieldId) -> &FieldInfo {
        &self.fields[id.0 as usize]
    }

    pub(crate) fn class_ids(&self) -> impl Iterator<Item = ClassId> + '_ {
        (0..self.classes.len()).map(|index| ClassId(index as u32))
    }

    pub(crate) fn method_ids(&self) -> impl Iterator<Item = MethodId> + '_ {
        (0..self.methods.len()).map(|index| MethodId(index as u32))
    }

    pub(crate) fn field_ids(&self) -> impl Iterator<Item = FieldId> + '_ {
        (0..self.fields.len()).map(|index| FieldId(index as u32))
    }

    pub(crate) fn class_by_name(&self, name: &str) -> Option<ClassId> {
        self.class_by_name.get(name).copied()
    }

    pub(crate) fn super_class(&self, class: ClassId) -> Option<ClassId> {
        self.class(class).super_class
    }

    pub(crate) fn strings(&self) -> &Interner {
        &self.strings
    }

    pub(crate) fn method_definition<'p>(&self, program: &'p Program, id: MethodId) -> &'p Method {
        let (class, method) = self.method(id).position;
        &program.classes[class].methods[method]
    }

    pub(crate) fn code<'p>(&self, program: &'p Program, id: MethodId) -> Option<&'p ControlFlowGraph> {
        self.method_definition(program, id).code.as_ref()
    }

    pub(crate) fn code_mut<'p>(
        &self,
        program: &'p mut Program,
        id: MethodId,
    ) -> Option<&'p mut ControlFlowGraph> {
        let (class, method) = self.method(id).position;
        program.classes[class].methods[method].code.as_mut()
    }

    /// Human-readable `Owner.name(desc)` label for logs and reports.
    pub(crate) fn method_label(&self, id: MethodId) -> String {
        let method = self.method(id);
        format!(
            "{}.{}{}",
            self.class(method.class).name,
            method.name,
            method.descriptor
        )
    }

    pub(crate) fn field_label(&self, id: FieldId) -> String {
        let field = self.field(id);
        format!(
            "{}.{}:{}",
            self.class(field.class).name,
            field.name,
            field.descriptor
        )
    }

    fn find_declared_method(&self, class: ClassId, name: &str, descriptor: &str) -> Option<MethodId> {
        self.class(class).methods.iter().copied().find(|method| {
            let info = self.method(*method);
            info.name == name && info.descriptor == descriptor
        })
    }

    /// Resolve an invoke reference to the definition the runtime would link.
    pub(crate) fn resolve_method(&self, reference: &MethodRef, kind: InvokeKind) -> Option<MethodId> {
        let owner = self.class_by_name(&reference.owner)?;
        let name = reference.name.as_str();
        let descriptor = reference.descriptor.as_str();
        if kind == InvokeKind::Interface {
            return self.search_interfaces(owner, name, descriptor);
        }
        let mut current = Some(owner);
        while let Some(class) = current {
            if let Some(method) = self.find_declared_method(class, name, descriptor) {
                return Some(method);
            }
            current = self.super_class(class);
        }
        if kind == InvokeKind::Virtual {
            // Default methods inherited from interfaces.
            let mut current = Some(owner);
            while let Some(class) = current {
                for interface in &self.class(class).interfaces {
                    if let Some(method) = self.search_interfaces(*interface, name, descriptor) {
                        return Some(method);
                    }
                }
                current = self.super_class(class);
            }
        }
        None
    }

    fn search_interfaces(&self, start: ClassId, name: &str, descriptor: &str) -> Option<MethodId> {
        let mut queue = VecDeque::from([start]);
        let mut visited = BTreeSet::new();
        while let Some(class) = queue.pop_front() {
            if !visited.insert(class) {
                continue;
            }
            if let Some(method) = self.find_declared_method(class, name, descriptor) {
                return Some(method);
            }
            queue.extend(self.class(class).interfaces.iter().copied());
        }
        None
    }

    pub(crate) fn resolve_field(&self, reference: &FieldRef) -> Option<FieldId> {
        let mut current = Some(self.class_by_name(&reference.owner)?);
        while let Some(class) = current {
            let found = self.class(class).fields.iter().copied().find(|field| {
                let info = self.field(*field);
                info.name == reference.name && info.descriptor == reference.descriptor
            });
            if found.is_some() {
                return found;
            }
            current = self.super_class(class);
        }
        None
    }

    /// Methods with the same signature in transitive subclasses or implementors.
    pub(crate) fn overrides(&self, method: MethodId) -> &[MethodId] {
        &self.overrides[method.0 as usize]
    }

    /// Methods whose value must be assumed unknown: kept, native, or reachable
    /// from code outside the program through an external super type.
    pub(crate) fn is_root_method(&self, method: MethodId) -> bool {
        let info = self.method(method);
        info.keep || info.is_native || self.overrides_external[method.0 as usize]
    }

    pub(crate) fn overrides_external(&self, method: MethodId) -> bool {
        self.overrides_external[method.0 as usize]
    }

    pub(crate) fn is_root_field(&self, field: FieldId) -> bool {
        let info = self.field(field);
        info.keep || self.class(info.class).keep
    }

    /// Methods containing a store to `field` (sput or iput, after resolution).
    pub(crate) fn writers(&self, field: FieldId) -> &BTreeSet<MethodId> {
        &self.writers[field.0 as usize]
    }

    fn compute_overrides(&self, method: MethodId) -> Vec<MethodId> {
        let info = self.method(method);
        if !info.is_virtual() {
            return Vec::new();
        }
        let mut result = Vec::new();
        let mut visited = BTreeSet::new();
        let mut queue: VecDeque<ClassId> = self.class(info.class).children.iter().copied().collect();
        while let Some(class) = queue.pop_front() {
            if !visited.insert(class) {
                continue;
            }
            if let Some(candidate) = self.find_declared_method(class, &info.name, &info.descriptor) {
                if self.method(candidate).is_virtual() {
                    result.push(candidate);
                }
            }
            queue.extend(self.class(class).children.iter().copied());
        }
        result.sort();
        result
    }

    fn compute_overrides_external(&self, method: MethodId) -> bool {
        let info = self.method(method);
        if !info.is_virtual() {
            return false;
        }
        if OBJECT_VIRTUALS
            .iter()
            .any(|(name, descriptor)| info.name == *name && info.descriptor == *descriptor)
        {
            return true;
        }
        let mut queue = VecDeque::from([info.class]);
        let mut visited = BTreeSet::new();
        while let Some(class) = queue.pop_front() {
            if !visited.insert(class) {
                continue;
            }
            let class_info = self.class(class);
            if class_info.has_external_parent {
                return true;
            }
            queue.extend(class_info.super_class);
            queue.extend(class_info.interfaces.iter().copied());
        }
        false
    }

    fn compute_writers(&self, program: &Program) -> Vec<BTreeSet<MethodId>> {
        let mut writers = vec![BTreeSet::new(); self.fields.len()];
        for method in self.method_ids() {
            let Some(cfg) = self.code(program, method) else {
                continue;
            };
            for block in &cfg.blocks {
                for instruction in &block.instructions {
                    let reference = match instruction {
                        Instruction::Sput { field, .. } | Instruction::Iput { field, .. } => field,
                        _ => continue,
                    };
                    if let Some(field) = self.resolve_field(reference) {
                        writers[field.0 as usize].insert(method);
                    }
                }
            }
        }
        writers
    }
}

/// Superclass and interface links must form a DAG; resolution and override
/// walks follow them without a visited set.
fn reject_inheritance_cycles(classes: &[ClassInfo]) -> Result<(), CpError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }
    let parents = |class: usize| {
        classes[class]
            .super_class
            .iter()
            .chain(classes[class].interfaces.iter())
            .map(|parent| parent.0 as usize)
            .collect::<Vec<_>>()
    };
    let mut marks = vec![Mark::Unvisited; classes.len()];
    for root in 0..classes.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        marks[root] = Mark::InProgress;
        let mut stack = vec![(root, parents(root), 0usize)];
        while let Some((class, links, next)) = stack.last_mut() {
            let Some(&parent) = links.get(*next) else {
                marks[*class] = Mark::Done;
                stack.pop();
                continue;
            };
            *next += 1;
            match marks[parent] {
                Mark::Done => {}
                Mark::InProgress => {
                    return Err(malformed_ir!(
                        "cyclic class hierarchy through {}",
                        classes[parent].name
                    ));
                }
                Mark::Unvisited => {
                    marks[parent] = Mark::InProgress;
                    stack.push((parent, parents(parent), 0));
                }
            }
        }
    }
    Ok(())
}

fn method_info(
    class: ClassId,
    class_index: usize,
    method_index: usize,
    class_name: &str,
    method: &Method,
) -> Result<MethodInfo, CpError> {
    let params = descriptor::parameter_categories(&method.descriptor).map_err(|error| {
        malformed_ir!("method {}.{}: {:#}", class_name, method.name, error)
    })?;
    let returns = descriptor::return_category(&method.descriptor).map_err(|error| {
        malformed_ir!("method {}.{}: {:#}", class_name, method.name, error)
    })?;
    Ok(MethodInfo {
        class,
        name: method.name.clone(),
        descriptor: method.descriptor.clone(),
        params,
        returns,
        is_static: method.access.is_static,
        is_private: method.access.is_private,
        is_native: method.access.is_native,
        is_abstract: method.access.is_abstract,
        keep: method.access.keep,
        position: (class_index, method_index),
    })
}

fn intern_literals(cfg: &ControlFlowGraph, strings: &mut Interner) {
    for block in &cfg.blocks {
        for instruction in &block.instructions {
            match instruction {
                Instruction::ConstString { string, .. } => {
                    strings.intern(string);
                }
                Instruction::ConstClass { class, .. } => {
                    strings.intern(class);
                }
                _ => {}
            }
        }
    }
}
