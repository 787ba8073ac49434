//! Shaders.
//!
//! A shader is created from two pieces: code already uploaded to a memory
//! block created with [`MemBlockFlags::CODE`], and a control section kept in
//! host memory. The control section is a small header followed by a table of
//! program entries; one entry is selected per shader.

use bytemuck::{Pod, Zeroable};
use cinder_core::constants::SHADER_CODE_ALIGNMENT;
use cinder_core::{GpuAddr, ShaderBinding, Stage};

use crate::error::{GpuError, Result};
use crate::memory::{MemBlock, MemBlockFlags};

/// Magic value at the start of every control section ("CSHD").
pub const CONTROL_MAGIC: u32 = 0x4448_5343;
/// Control section version understood by this layer.
pub const CONTROL_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ControlHeader {
    magic: u32,
    version: u32,
    stage: u32,
    num_programs: u32,
}

/// One program in a control section.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ProgramEntry {
    /// Offset of the program relative to the shader's code offset.
    pub code_offset: u32,
    pub code_size: u32,
    pub num_gprs: u32,
    pub const_buf_size: u32,
}

/// Build a control section for `stage` holding `programs`.
pub fn encode_control(stage: Stage, programs: &[ProgramEntry]) -> Vec<u8> {
    let header = ControlHeader {
        magic: CONTROL_MAGIC,
        version: CONTROL_VERSION,
        stage: stage.raw(),
        num_programs: programs.len() as u32,
    };
    let mut out = Vec::with_capacity(
        std::mem::size_of::<ControlHeader>() + std::mem::size_of_val(programs),
    );
    out.extend_from_slice(bytemuck::bytes_of(&header));
    out.extend_from_slice(bytemuck::cast_slice(programs));
    out
}

/// Parameters for [`Shader::new`].
#[derive(Debug, Clone, Copy)]
pub struct ShaderConfig<'a> {
    pub code_mem: &'a MemBlock,
    pub code_offset: u32,
    pub control: &'a [u8],
    pub program_id: u32,
}

impl<'a> ShaderConfig<'a> {
    pub fn new(code_mem: &'a MemBlock, code_offset: u32, control: &'a [u8]) -> Self {
        Self {
            code_mem,
            code_offset,
            control,
            program_id: 0,
        }
    }

    pub fn with_program_id(mut self, program_id: u32) -> Self {
        self.program_id = program_id;
        self
    }
}

/// A shader program ready to be bound.
///
/// `Shader::default()` is an invalid shader; binding it and then drawing
/// faults the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shader {
    stage: Stage,
    valid: bool,
    code_addr: GpuAddr,
    program: ProgramEntry,
    program_id: u32,
}

impl Default for Shader {
    fn default() -> Self {
        Self {
            stage: Stage::Vertex,
            valid: false,
            code_addr: 0,
            program: ProgramEntry::default(),
            program_id: 0,
        }
    }
}

fn invalid(msg: impl Into<String>) -> GpuError {
    GpuError::InvalidArgument(msg.into())
}

impl Shader {
    pub fn new(config: &ShaderConfig<'_>) -> Result<Self> {
        if !config.code_mem.flags().contains(MemBlockFlags::CODE) {
            return Err(invalid("shader code block was not created with the CODE flag"));
        }
        if config.code_offset % SHADER_CODE_ALIGNMENT != 0 {
            return Err(invalid(format!(
                "shader code offset {:#x} is not aligned to {SHADER_CODE_ALIGNMENT:#x}",
                config.code_offset
            )));
        }

        let header_size = std::mem::size_of::<ControlHeader>();
        if config.control.len() < header_size {
            return Err(invalid("shader control section is truncated"));
        }
        let header: ControlHeader = bytemuck::pod_read_unaligned(&config.control[..header_size]);
        if header.magic != CONTROL_MAGIC || header.version != CONTROL_VERSION {
            return Err(invalid("shader control section has an unknown header"));
        }
        let stage = Stage::from_raw(header.stage)
            .ok_or_else(|| invalid(format!("unknown shader stage {}", header.stage)))?;
        if config.program_id >= header.num_programs {
            return Err(invalid(format!(
                "program {} not present, control section holds {}",
                config.program_id, header.num_programs
            )));
        }

        let entry_size = std::mem::size_of::<ProgramEntry>();
        let start = header_size + config.program_id as usize * entry_size;
        let entry_bytes = config
            .control
            .get(start..start + entry_size)
            .ok_or_else(|| invalid("shader control section is truncated"))?;
        let program: ProgramEntry = bytemuck::pod_read_unaligned(entry_bytes);

        let code_start = u64::from(config.code_offset) + u64::from(program.code_offset);
        if program.code_size == 0
            || code_start + u64::from(program.code_size) > u64::from(config.code_mem.size())
        {
            return Err(invalid(format!(
                "program code {code_start:#x}+{:#x} is outside the code block",
                program.code_size
            )));
        }

        Ok(Self {
            stage,
            valid: true,
            code_addr: config.code_mem.gpu_addr() + code_start,
            program,
            program_id: config.program_id,
        })
    }

    pub const fn is_valid(&self) -> bool {
        self.valid
    }

    pub const fn stage(&self) -> Stage {
        self.stage
    }

    pub const fn code_addr(&self) -> GpuAddr {
        self.code_addr
    }

    pub const fn program(&self) -> &ProgramEntry {
        &self.program
    }

    pub(crate) const fn binding(&self) -> ShaderBinding {
        ShaderBinding {
            stage: self.stage,
            valid: self.valid,
            code_addr: self.code_addr,
            code_size: self.program.code_size,
            program_id: self.program_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceConfig};
    use crate::memory::MemBlockConfig;

    fn code_block(device: &Device) -> MemBlock {
        let config = MemBlockConfig::new(0x1000)
            .with_flags(MemBlockFlags::default() | MemBlockFlags::CODE);
        MemBlock::new(device, config).unwrap()
    }

    fn program(size: u32) -> ProgramEntry {
        ProgramEntry {
            code_offset: 0,
            code_size: size,
            num_gprs: 8,
            const_buf_size: 0,
        }
    }

    #[test]
    fn default_shader_is_invalid() {
        let shader = Shader::default();
        assert!(!shader.is_valid());
        assert!(!shader.binding().valid);
    }

    #[test]
    fn creates_shader_from_control_section() {
        let device = Device::new(DeviceConfig::default()).unwrap();
        let block = code_block(&device);
        let control = encode_control(
            Stage::Fragment,
            &[program(0x80), ProgramEntry { code_offset: 0x100, ..program(0x40) }],
        );

        let shader = Shader::new(&ShaderConfig::new(&block, 0x200, &control).with_program_id(1))
            .unwrap();
        assert!(shader.is_valid());
        assert_eq!(shader.stage(), Stage::Fragment);
        assert_eq!(shader.code_addr(), block.gpu_addr() + 0x300);
        assert_eq!(shader.program().code_size, 0x40);
    }

    #[test]
    fn rejects_bad_placement() {
        let device = Device::new(DeviceConfig::default()).unwrap();
        let block = code_block(&device);
        let control = encode_control(Stage::Vertex, &[program(0x100)]);

        assert!(Shader::new(&ShaderConfig::new(&block, 0x80, &control)).is_err());
        assert!(Shader::new(&ShaderConfig::new(&block, 0xf00, &control)).is_ok());
        assert!(Shader::new(&ShaderConfig::new(&block, 0x1000, &control)).is_err());
        assert!(Shader::new(&ShaderConfig::new(&block, 0, &control).with_program_id(1)).is_err());
        assert!(Shader::new(&ShaderConfig::new(&block, 0, &control[..8])).is_err());

        let plain = MemBlock::new(&device, MemBlockConfig::new(0x1000)).unwrap();
        assert!(Shader::new(&ShaderConfig::new(&plain, 0, &control)).is_err());
    }
}
