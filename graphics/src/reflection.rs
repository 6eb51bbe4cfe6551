//! Shader interface map.
//!
//! Reflection data is produced by an external shader compiler and handed over
//! per stage as a [`StageReflection`]: the interface blocks, samplers, images
//! and push-constant blocks the stage declares, plus its vertex inputs.
//!
//! [`InterfaceMap::merge`] folds the stages of one program into a single
//! slot-indexed table. A slot seen from several stages becomes one entry whose
//! stage mask is the union of those stages; a slot declared with two different
//! kinds is rejected. Push-constant blocks are merged by name and placed one
//! after the other.
//!
//! # Example
//!
//! ```ignore
//! let vertex = StageReflection::new(ShaderStage::Vertex)
//!     .with_binding(InterfaceBinding::uniform_block("globals", 0, 80).with_variable("color", 64))
//!     .with_input(VertexInput::new("ngl_position", 0));
//! let fragment = StageReflection::new(ShaderStage::Fragment)
//!     .with_binding(InterfaceBinding::uniform_block("globals", 0, 80));
//!
//! let map = InterfaceMap::merge(&[vertex, fragment])?;
//! assert_eq!(map.slot(0).unwrap().stages, ShaderStageFlags::VERTEX | ShaderStageFlags::FRAGMENT);
//! ```

use std::collections::BTreeMap;
use std::fmt;

use crate::backend::DescriptorKind;
use crate::error::BindingError;

bitflags::bitflags! {
    /// Capability flags attached to a reflected interface entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InterfaceFlags: u32 {
        /// Push-constant block.
        const CONSTANT = 1 << 0;
        /// Uniform block.
        const UNIFORM = 1 << 1;
        /// Storage block.
        const STORAGE = 1 << 2;
        /// Combined image sampler.
        const SAMPLER = 1 << 3;
        /// Storage image.
        const TEXTURE = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Shader stages that access a binding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStageFlags: u32 {
        /// Vertex shader stage.
        const VERTEX = 1 << 0;
        /// Fragment shader stage.
        const FRAGMENT = 1 << 1;
        /// Compute shader stage.
        const COMPUTE = 1 << 2;
    }
}

/// A single shader stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    /// Stage mask containing only this stage.
    pub fn flag(self) -> ShaderStageFlags {
        match self {
            Self::Vertex => ShaderStageFlags::VERTEX,
            Self::Fragment => ShaderStageFlags::FRAGMENT,
            Self::Compute => ShaderStageFlags::COMPUTE,
        }
    }
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Vertex => "vertex",
            Self::Fragment => "fragment",
            Self::Compute => "compute",
        };
        f.write_str(name)
    }
}

/// Resource kind of a reflected entry, derived from its [`InterfaceFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    PushConstant,
    UniformBlock,
    StorageBlock,
    SampledImage,
    StorageImage,
}

impl BindingKind {
    /// Classify `flags`. The first matching flag wins, in declaration order of
    /// [`InterfaceFlags`].
    pub fn from_flags(flags: InterfaceFlags) -> Option<Self> {
        if flags.contains(InterfaceFlags::CONSTANT) {
            Some(Self::PushConstant)
        } else if flags.contains(InterfaceFlags::UNIFORM) {
            Some(Self::UniformBlock)
        } else if flags.contains(InterfaceFlags::STORAGE) {
            Some(Self::StorageBlock)
        } else if flags.contains(InterfaceFlags::SAMPLER) {
            Some(Self::SampledImage)
        } else if flags.contains(InterfaceFlags::TEXTURE) {
            Some(Self::StorageImage)
        } else {
            None
        }
    }

    /// Descriptor type used for this kind, `None` for push constants.
    pub fn descriptor_kind(self) -> Option<DescriptorKind> {
        match self {
            Self::PushConstant => None,
            Self::UniformBlock => Some(DescriptorKind::UniformBuffer),
            Self::StorageBlock => Some(DescriptorKind::StorageBuffer),
            Self::SampledImage => Some(DescriptorKind::CombinedImageSampler),
            Self::StorageImage => Some(DescriptorKind::StorageImage),
        }
    }
}

impl fmt::Display for BindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PushConstant => "push constant",
            Self::UniformBlock => "uniform block",
            Self::StorageBlock => "storage block",
            Self::SampledImage => "sampled image",
            Self::StorageImage => "storage image",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Per-stage reflection
// ============================================================================

/// A named member of a reflected block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockVariable {
    pub name: String,
    /// Byte offset inside the block.
    pub offset: u32,
}

/// One reflected interface entry of a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceBinding {
    /// Block, sampler or image name.
    pub name: String,
    /// Binding slot. Unused for push constants.
    pub index: u32,
    pub flags: InterfaceFlags,
    /// Block size in bytes, 0 for images.
    pub size: u32,
    /// Block members, empty for images.
    pub variables: Vec<BlockVariable>,
}

impl InterfaceBinding {
    /// Create an entry with explicit flags.
    pub fn new(name: impl Into<String>, index: u32, flags: InterfaceFlags, size: u32) -> Self {
        Self {
            name: name.into(),
            index,
            flags,
            size,
            variables: Vec::new(),
        }
    }

    /// A uniform block of `size` bytes at slot `index`.
    pub fn uniform_block(name: impl Into<String>, index: u32, size: u32) -> Self {
        Self::new(name, index, InterfaceFlags::UNIFORM, size)
    }

    /// A storage block of `size` bytes at slot `index`.
    pub fn storage_block(name: impl Into<String>, index: u32, size: u32) -> Self {
        Self::new(name, index, InterfaceFlags::STORAGE, size)
    }

    /// A combined image sampler at slot `index`.
    pub fn sampler(name: impl Into<String>, index: u32) -> Self {
        Self::new(name, index, InterfaceFlags::SAMPLER, 0)
    }

    /// A storage image at slot `index`.
    pub fn storage_image(name: impl Into<String>, index: u32) -> Self {
        Self::new(name, index, InterfaceFlags::TEXTURE, 0)
    }

    /// A push-constant block of `size` bytes.
    pub fn push_constants(name: impl Into<String>, size: u32) -> Self {
        Self::new(name, 0, InterfaceFlags::CONSTANT, size)
    }

    /// Add a block member at `offset`.
    pub fn with_variable(mut self, name: impl Into<String>, offset: u32) -> Self {
        self.variables.push(BlockVariable {
            name: name.into(),
            offset,
        });
        self
    }

    /// Classified kind.
    pub fn kind(&self) -> Option<BindingKind> {
        BindingKind::from_flags(self.flags)
    }

    /// Member named `name`.
    pub fn variable(&self, name: &str) -> Option<&BlockVariable> {
        self.variables.iter().find(|v| v.name == name)
    }
}

/// A reflected vertex shader input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexInput {
    pub name: String,
    pub location: u32,
}

impl VertexInput {
    pub fn new(name: impl Into<String>, location: u32) -> Self {
        Self {
            name: name.into(),
            location,
        }
    }
}

/// Reflection of a single compiled stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReflection {
    pub stage: ShaderStage,
    pub bindings: Vec<InterfaceBinding>,
    pub inputs: Vec<VertexInput>,
}

impl StageReflection {
    /// Empty reflection for `stage`.
    pub fn new(stage: ShaderStage) -> Self {
        Self {
            stage,
            bindings: Vec::new(),
            inputs: Vec::new(),
        }
    }

    pub fn with_binding(mut self, binding: InterfaceBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn with_input(mut self, input: VertexInput) -> Self {
        self.inputs.push(input);
        self
    }
}

// ============================================================================
// Merged program interface
// ============================================================================

/// A descriptor slot after merging every stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotEntry {
    pub name: String,
    pub slot: u32,
    pub kind: BindingKind,
    pub stages: ShaderStageFlags,
    pub size: u32,
    pub variables: Vec<BlockVariable>,
}

impl SlotEntry {
    /// Block member named `name`.
    pub fn variable(&self, name: &str) -> Option<&BlockVariable> {
        self.variables.iter().find(|v| v.name == name)
    }
}

/// A push-constant block after merging every stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushConstantBlock {
    pub name: String,
    /// Offset inside the pipeline push-constant range.
    pub offset: u32,
    pub size: u32,
    pub stages: ShaderStageFlags,
}

/// Slot-indexed interface of a whole program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceMap {
    slots: BTreeMap<u32, SlotEntry>,
    push_constants: Vec<PushConstantBlock>,
    vertex_inputs: Vec<VertexInput>,
}

impl InterfaceMap {
    /// Merge the reflection of every stage of a program.
    pub fn merge(stages: &[StageReflection]) -> Result<Self, BindingError> {
        let mut map = Self::default();

        for stage in stages {
            let flag = stage.stage.flag();
            for binding in &stage.bindings {
                let Some(kind) = binding.kind() else {
                    log::debug!(
                        "{}: {} has no usable interface flag, ignored",
                        stage.stage,
                        binding.name
                    );
                    continue;
                };
                if kind == BindingKind::PushConstant {
                    map.merge_push_constants(binding, flag);
                } else {
                    map.merge_slot(binding, kind, flag)?;
                }
            }
            if stage.stage == ShaderStage::Vertex {
                map.vertex_inputs.extend(stage.inputs.iter().cloned());
            }
        }

        Ok(map)
    }

    fn merge_slot(
        &mut self,
        binding: &InterfaceBinding,
        kind: BindingKind,
        stage: ShaderStageFlags,
    ) -> Result<(), BindingError> {
        match self.slots.get_mut(&binding.index) {
            Some(entry) if entry.kind != kind => Err(BindingError::BindingConflict {
                slot: binding.index,
                existing: entry.kind,
                requested: kind,
            }),
            Some(entry) => {
                entry.stages |= stage;
                entry.size = entry.size.max(binding.size);
                for variable in &binding.variables {
                    if !entry.variables.iter().any(|v| v.name == variable.name) {
                        entry.variables.push(variable.clone());
                    }
                }
                Ok(())
            }
            None => {
                self.slots.insert(
                    binding.index,
                    SlotEntry {
                        name: binding.name.clone(),
                        slot: binding.index,
                        kind,
                        stages: stage,
                        size: binding.size,
                        variables: binding.variables.clone(),
                    },
                );
                Ok(())
            }
        }
    }

    fn merge_push_constants(&mut self, binding: &InterfaceBinding, stage: ShaderStageFlags) {
        if let Some(block) = self
            .push_constants
            .iter_mut()
            .find(|block| block.name == binding.name)
        {
            block.stages |= stage;
            if binding.size > block.size {
                block.size = binding.size;
                let mut offset = 0;
                for entry in &mut self.push_constants {
                    entry.offset = offset;
                    offset += entry.size;
                }
            }
            return;
        }
        let offset = self.push_constant_size();
        self.push_constants.push(PushConstantBlock {
            name: binding.name.clone(),
            offset,
            size: binding.size,
            stages: stage,
        });
    }

    /// Merged descriptor slots, ordered by slot.
    pub fn slots(&self) -> impl Iterator<Item = &SlotEntry> {
        self.slots.values()
    }

    /// Entry at `slot`.
    pub fn slot(&self, slot: u32) -> Option<&SlotEntry> {
        self.slots.get(&slot)
    }

    /// Entry named `name`.
    pub fn find(&self, name: &str) -> Option<&SlotEntry> {
        self.slots.values().find(|entry| entry.name == name)
    }

    /// Merged push-constant blocks, in first-seen order.
    pub fn push_constants(&self) -> &[PushConstantBlock] {
        &self.push_constants
    }

    /// Total push-constant bytes.
    pub fn push_constant_size(&self) -> u32 {
        self.push_constants
            .last()
            .map_or(0, |block| block.offset + block.size)
    }

    /// Inputs declared by the vertex stage.
    pub fn vertex_inputs(&self) -> &[VertexInput] {
        &self.vertex_inputs
    }

    /// Number of slots of each descriptor kind.
    pub fn descriptor_count(&self, kind: DescriptorKind) -> u32 {
        self.slots
            .values()
            .filter(|entry| entry.kind.descriptor_kind() == Some(kind))
            .count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_order() {
        let flags = InterfaceFlags::CONSTANT | InterfaceFlags::UNIFORM;
        assert_eq!(BindingKind::from_flags(flags), Some(BindingKind::PushConstant));
        assert_eq!(
            BindingKind::from_flags(InterfaceFlags::SAMPLER),
            Some(BindingKind::SampledImage)
        );
        assert_eq!(BindingKind::from_flags(InterfaceFlags::empty()), None);
    }

    #[test]
    fn test_same_slot_merges_stages() {
        let vertex = StageReflection::new(ShaderStage::Vertex).with_binding(
            InterfaceBinding::uniform_block("globals", 0, 64).with_variable("mvp", 0),
        );
        let fragment = StageReflection::new(ShaderStage::Fragment).with_binding(
            InterfaceBinding::uniform_block("globals", 0, 80).with_variable("color", 64),
        );

        let map = InterfaceMap::merge(&[vertex, fragment]).unwrap();
        assert_eq!(map.slots().count(), 1);
        let entry = map.slot(0).unwrap();
        assert_eq!(
            entry.stages,
            ShaderStageFlags::VERTEX | ShaderStageFlags::FRAGMENT
        );
        assert_eq!(entry.size, 80);
        assert_eq!(entry.variables.len(), 2);
    }

    #[test]
    fn test_kind_conflict_is_rejected() {
        let vertex = StageReflection::new(ShaderStage::Vertex)
            .with_binding(InterfaceBinding::uniform_block("a", 2, 16));
        let fragment = StageReflection::new(ShaderStage::Fragment)
            .with_binding(InterfaceBinding::sampler("b", 2));

        let err = InterfaceMap::merge(&[vertex, fragment]).unwrap_err();
        assert!(matches!(
            err,
            BindingError::BindingConflict {
                slot: 2,
                existing: BindingKind::UniformBlock,
                requested: BindingKind::SampledImage,
            }
        ));
    }

    #[test]
    fn test_push_constants_merge_by_name() {
        let vertex = StageReflection::new(ShaderStage::Vertex)
            .with_binding(InterfaceBinding::push_constants("transforms", 128));
        let fragment = StageReflection::new(ShaderStage::Fragment)
            .with_binding(InterfaceBinding::push_constants("transforms", 128))
            .with_binding(InterfaceBinding::push_constants("extra", 16));

        let map = InterfaceMap::merge(&[vertex, fragment]).unwrap();
        let blocks = map.push_constants();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(
            blocks[0].stages,
            ShaderStageFlags::VERTEX | ShaderStageFlags::FRAGMENT
        );
        assert_eq!(blocks[1].offset, 128);
        assert_eq!(map.push_constant_size(), 144);
    }

    #[test]
    fn test_push_constants_grow_to_largest_declaration() {
        let vertex = StageReflection::new(ShaderStage::Vertex)
            .with_binding(InterfaceBinding::push_constants("transforms", 64))
            .with_binding(InterfaceBinding::push_constants("extra", 16));
        let fragment = StageReflection::new(ShaderStage::Fragment)
            .with_binding(InterfaceBinding::push_constants("transforms", 128));

        let map = InterfaceMap::merge(&[vertex, fragment]).unwrap();
        let blocks = map.push_constants();
        assert_eq!(blocks[0].size, 128);
        assert_eq!(blocks[1].offset, 128);
        assert_eq!(map.push_constant_size(), 144);
    }

    #[test]
    fn test_vertex_inputs_only_from_vertex_stage() {
        let vertex = StageReflection::new(ShaderStage::Vertex)
            .with_input(VertexInput::new("ngl_position", 0));
        let fragment = StageReflection::new(ShaderStage::Fragment)
            .with_input(VertexInput::new("ignored", 3));

        let map = InterfaceMap::merge(&[vertex, fragment]).unwrap();
        assert_eq!(map.vertex_inputs(), &[VertexInput::new("ngl_position", 0)]);
    }

    #[test]
    fn test_descriptor_counts() {
        let stage = StageReflection::new(ShaderStage::Compute)
            .with_binding(InterfaceBinding::uniform_block("u", 0, 16))
            .with_binding(InterfaceBinding::storage_block("s0", 1, 16))
            .with_binding(InterfaceBinding::storage_block("s1", 2, 16))
            .with_binding(InterfaceBinding::storage_image("img", 3));

        let map = InterfaceMap::merge(&[stage]).unwrap();
        assert_eq!(map.descriptor_count(DescriptorKind::UniformBuffer), 1);
        assert_eq!(map.descriptor_count(DescriptorKind::StorageBuffer), 2);
        assert_eq!(map.descriptor_count(DescriptorKind::StorageImage), 1);
        assert_eq!(map.descriptor_count(DescriptorKind::CombinedImageSampler), 0);
        assert_eq!(map.find("s1").map(|e| e.slot), Some(2));
    }
}
