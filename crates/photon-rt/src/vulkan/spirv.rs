//! Just enough SPIR-V parsing to list a module's ray tracing entry points.

use ash::vk;

use crate::error::{Result, RtError};
use crate::module::ProgramKind;

const MAGIC: u32 = 0x0723_0203;
const HEADER_WORDS: usize = 5;
const OP_ENTRY_POINT: u32 = 15;

/// An `OpEntryPoint` with a ray tracing execution model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpirvEntry {
    pub name: String,
    pub stage: vk::ShaderStageFlags,
}

/// Execution model to stage. Only the ray tracing models are of interest.
fn stage(execution_model: u32) -> Option<vk::ShaderStageFlags> {
    Some(match execution_model {
        5313 => vk::ShaderStageFlags::RAYGEN_KHR,
        5314 => vk::ShaderStageFlags::INTERSECTION_KHR,
        5315 => vk::ShaderStageFlags::ANY_HIT_KHR,
        5316 => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        5317 => vk::ShaderStageFlags::MISS_KHR,
        5318 => vk::ShaderStageFlags::CALLABLE_KHR,
        _ => return None,
    })
}

/// Stage a program of `kind` must be compiled for.
pub fn stage_for(kind: ProgramKind) -> Option<vk::ShaderStageFlags> {
    match kind {
        ProgramKind::Raygen => Some(vk::ShaderStageFlags::RAYGEN_KHR),
        ProgramKind::Miss => Some(vk::ShaderStageFlags::MISS_KHR),
        ProgramKind::ClosestHit => Some(vk::ShaderStageFlags::CLOSEST_HIT_KHR),
        ProgramKind::AnyHit => Some(vk::ShaderStageFlags::ANY_HIT_KHR),
        ProgramKind::Intersection => Some(vk::ShaderStageFlags::INTERSECTION_KHR),
        ProgramKind::DirectCallable | ProgramKind::ContinuationCallable => {
            Some(vk::ShaderStageFlags::CALLABLE_KHR)
        }
        ProgramKind::Exception | ProgramKind::HitGroup | ProgramKind::CallableGroup => None,
    }
}

/// Literal string starting at `words[0]`: UTF-8, NUL terminated, padded to
/// a word boundary.
fn literal_string(words: &[u32]) -> Option<String> {
    let mut bytes = Vec::new();
    for word in words {
        for byte in word.to_le_bytes() {
            if byte == 0 {
                return String::from_utf8(bytes).ok();
            }
            bytes.push(byte);
        }
    }
    None
}

/// Every ray tracing entry point declared by `words`.
pub fn entry_points(words: &[u32]) -> Result<Vec<SpirvEntry>> {
    if words.len() < HEADER_WORDS || words[0] != MAGIC {
        return Err(RtError::invalid_value("not a SPIR-V module"));
    }
    let mut entries = Vec::new();
    let mut at = HEADER_WORDS;
    while at < words.len() {
        let opcode = words[at] & 0xFFFF;
        let count = (words[at] >> 16) as usize;
        if count == 0 || at + count > words.len() {
            return Err(RtError::invalid_value(format!(
                "malformed SPIR-V instruction at word {at}"
            )));
        }
        if opcode == OP_ENTRY_POINT && count >= 4 {
            let operands = &words[at + 1..at + count];
            if let Some(stage) = stage(operands[0]) {
                let name = literal_string(&operands[2..]).ok_or_else(|| {
                    RtError::invalid_value("entry point name is not a valid string")
                })?;
                entries.push(SpirvEntry { name, stage });
            }
        }
        at += count;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_words(name: &str) -> Vec<u32> {
        let mut bytes = name.as_bytes().to_vec();
        bytes.push(0);
        bytes.resize(bytes.len().div_ceil(4) * 4, 0);
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn entry(model: u32, id: u32, name: &str) -> Vec<u32> {
        let name = name_words(name);
        let count = 3 + name.len() as u32;
        let mut words = vec![(count << 16) | OP_ENTRY_POINT, model, id];
        words.extend(name);
        words
    }

    fn module(entries: &[Vec<u32>]) -> Vec<u32> {
        let mut words = vec![MAGIC, 0x0001_0400, 0, 100, 0];
        // OpCapability RayTracingKHR
        words.extend([(2 << 16) | 17, 4479]);
        for e in entries {
            words.extend(e);
        }
        words
    }

    #[test]
    fn finds_ray_tracing_entries() {
        let words = module(&[
            entry(5313, 1, "__raygen__main"),
            entry(5, 2, "compute_main"),
            entry(5314, 3, "__intersection__sphere"),
        ]);
        let entries = entry_points(&words).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "__raygen__main");
        assert_eq!(entries[0].stage, vk::ShaderStageFlags::RAYGEN_KHR);
        assert_eq!(entries[1].stage, vk::ShaderStageFlags::INTERSECTION_KHR);
    }

    #[test]
    fn rejects_garbage() {
        assert!(entry_points(&[1, 2, 3]).is_err());
        let mut words = module(&[]);
        words.push(10 << 16);
        assert!(entry_points(&words).is_err());
    }
}
