use std::{collections::HashMap, path::Path};

use object::{Object, ObjectSection, ObjectSymbol};
use snafu::{ResultExt, Snafu};

use crate::{
    hook::{Hook, HookKind, SENTINEL_FUNC_ADDRESS},
    target::CodeTarget,
    util::io::{self, FileError},
};

#[derive(Debug, Snafu)]
pub enum HookCollectError {
    #[snafu(transparent)]
    File { source: FileError },
    #[snafu(display("failed to parse object file '{path}': {source}"))]
    Parse { path: String, source: object::Error },
}

/// Accumulates reserve bytes (20 per `Safe` hook) needed in each target's
/// `.text.<target>` section for veneer slots, and the set of named hooks
/// still awaiting a `func_address` from the linked ELF.
#[derive(Debug, Default)]
pub struct HookCollection {
    pub hooks_by_symbol: HashMap<String, Hook>,
    pub safe_reserve: HashMap<CodeTarget, usize>,
}

/// Outcome of parsing a section name against the `.<kind>.<target>.<hexaddr>`
/// marker grammar: a name whose kind prefix doesn't match at all is not a
/// marker section; one whose prefix matches but whose target/address fails
/// to parse is a malformed marker, distinct from "not a marker".
enum MarkerParse {
    NotAMarker,
    Invalid,
    Valid(HookKind, CodeTarget, u32),
}

/// Splits a marker section name `.<kind>.<target>.<hexaddr>` into its parts.
fn parse_marker_name(name: &str) -> MarkerParse {
    let Some(rest) = name.strip_prefix('.') else { return MarkerParse::NotAMarker };
    let mut parts = rest.splitn(2, '.');
    let Some(kind_str) = parts.next() else { return MarkerParse::NotAMarker };
    let kind = match kind_str {
        "hook" => HookKind::Hook,
        "rlnk" => HookKind::Link,
        "safe" => HookKind::Safe,
        "over" => HookKind::Replace,
        _ => return MarkerParse::NotAMarker,
    };
    let Some(remainder) = parts.next() else { return MarkerParse::Invalid };
    let Some(dot) = remainder.rfind('.') else { return MarkerParse::Invalid };
    let (target_str, addr_str) = remainder.split_at(dot);
    let addr_str = addr_str.trim_start_matches('.');
    let Ok(target) = target_str.parse::<CodeTarget>() else { return MarkerParse::Invalid };
    let Ok(address) = u32::from_str_radix(addr_str, 16) else { return MarkerParse::Invalid };
    MarkerParse::Valid(kind, target, address)
}

/// Scans one compiled object for marker sections and their defining symbols,
/// folding the results into `collection`.
pub fn collect_hooks_from_object(path: &Path, collection: &mut HookCollection) -> Result<(), HookCollectError> {
    let bytes = io::read_file(path)?;
    let file = object::File::parse(bytes.as_slice()).context(ParseSnafu { path: path.to_string_lossy() })?;

    let mut section_hooks: HashMap<object::SectionIndex, (HookKind, CodeTarget, u32)> = HashMap::new();

    for section in file.sections() {
        let Ok(name) = section.name() else { continue };
        let (kind, target, address) = match parse_marker_name(name) {
            MarkerParse::Valid(kind, target, address) => (kind, target, address),
            MarkerParse::Invalid => {
                log::warn!("section '{name}' looks like a marker but has an invalid target/address, skipping");
                continue;
            }
            MarkerParse::NotAMarker => continue,
        };
        if kind == HookKind::Safe && address % 2 == 0 {
            *collection.safe_reserve.entry(target).or_insert(0) += 20;
        }
        section_hooks.insert(section.index(), (kind, target, address));
    }

    if section_hooks.is_empty() {
        return Ok(());
    }

    for symbol in file.symbols() {
        let Some(section_index) = symbol.section().index() else { continue };
        let Some(&(kind, target, address)) = section_hooks.get(&section_index) else { continue };
        if kind == HookKind::Replace {
            // Replace hooks need no named symbol; the section itself carries the payload.
            continue;
        }
        let Ok(name) = symbol.name() else { continue };
        if name.starts_with('$') {
            continue; // ELF mapping symbol, not a user-defined hook function.
        }
        if symbol.address() >= 2 {
            continue; // Not the section-defining symbol for this hook.
        }
        collection.hooks_by_symbol.insert(
            name.to_string(),
            Hook { target, kind, hook_address: address, func_address: SENTINEL_FUNC_ADDRESS },
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_marker_name() {
        assert!(matches!(parse_marker_name(".hook.arm9.2001000"), MarkerParse::Valid(HookKind::Hook, CodeTarget::Arm9, 0x0200_1000)));
        assert!(matches!(parse_marker_name(".rlnk.ov9_3.21f0040"), MarkerParse::Valid(HookKind::Link, CodeTarget::Overlay9(3), 0x021F_0040)));
        assert!(matches!(parse_marker_name(".safe.arm7.6001000"), MarkerParse::Valid(HookKind::Safe, CodeTarget::Arm7, 0x0600_1000)));
        assert!(matches!(parse_marker_name(".text"), MarkerParse::NotAMarker));
        assert!(matches!(parse_marker_name(".hook.bogus.1234"), MarkerParse::Invalid));
    }
}
