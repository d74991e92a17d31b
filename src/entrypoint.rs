// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entrypoint & Priority Model (component E).
//!
//! Derives the set of asynchronous entrypoints from the vector table and
//! the config's enabled/priority settings. Reset is always present, at the
//! lowest priority (preemptible by everything); NMI, when enabled, preempts
//! everything else.

use crate::config::Config;
use crate::error::AnalysisError;
use crate::loader::Image;

/// Cortex-M exception entry pushes 8 words onto the active stack before a
/// handler's own prologue runs.
pub const EXCEPTION_FRAME_COST: u32 = 32;

/// Vector-table index of the fixed v6-m system exceptions. MemManage,
/// BusFault and UsageFault (indices 4-6) and the reserved slots do not
/// exist on Cortex-M0 and are never enumerated here.
const RESET: u32 = 1;
const NMI: u32 = 2;
const HARDFAULT: u32 = 3;
const SVCALL: u32 = 11;
const PENDSV: u32 = 14;
const SYSTICK: u32 = 15;
/// External interrupts occupy vector-table indices 16 and up.
const FIRST_IRQ: u32 = 16;

#[derive(Clone, Debug)]
pub struct Entrypoint {
    pub name: String,
    pub vector_index: u32,
    pub handler: String,
    /// Lower preempts higher. Reset uses `i32::MAX` (preemptible by
    /// anything); NMI uses `i32::MIN` (preempts everything).
    pub priority_group: i32,
    pub enabled: bool,
}

pub fn derive(
    image: &Image,
    config: &Config,
) -> Result<Vec<Entrypoint>, AnalysisError> {
    let mut entrypoints = vec![Entrypoint {
        name: "reset".into(),
        vector_index: RESET,
        handler: handler_at(image, RESET, &config.default_handler)?,
        priority_group: i32::MAX,
        enabled: true,
    }];

    let fixed = [
        (NMI, "nmi", config.nmi, i32::MIN),
        (HARDFAULT, "hardfault", config.hardfault, 0),
        (SVCALL, "svcall", config.svcall, 0),
        (PENDSV, "pendsv", config.pendsv, 0),
        (SYSTICK, "systick", config.systick, 0),
    ];
    for (index, name, setting, nmi_override) in fixed {
        let Some(priority_group) = setting else {
            continue;
        };
        let priority_group = if index == NMI { nmi_override } else { priority_group };
        entrypoints.push(Entrypoint {
            name: name.into(),
            vector_index: index,
            handler: handler_at(image, index, &config.default_handler)?,
            priority_group,
            enabled: true,
        });
    }

    for irq in &config.interrupts {
        if irq.number < FIRST_IRQ {
            return Err(AnalysisError::ConfigInvalid {
                detail: format!(
                    "interrupt number {} collides with a fixed system exception \
                     (external interrupts start at {FIRST_IRQ})",
                    irq.number
                ),
            });
        }
        entrypoints.push(Entrypoint {
            name: irq.name.clone(),
            vector_index: irq.number,
            handler: irq.name.clone(),
            priority_group: irq.priority_group,
            enabled: true,
        });
    }

    // Deterministic ascending order by vector index (spec.md §5).
    entrypoints.sort_by_key(|e| e.vector_index);
    Ok(entrypoints)
}

fn handler_at(
    image: &Image,
    vector_index: u32,
    default_handler: &Option<String>,
) -> Result<String, AnalysisError> {
    let address = *image.vector_table.get(vector_index as usize).ok_or_else(
        || AnalysisError::ConfigInvalid {
            detail: format!(
                "vector table has no entry at index {vector_index}"
            ),
        },
    )?;
    let address = address & !1;
    if let Some((name, _)) = image.function_symbol_at(address) {
        return Ok(name.to_string());
    }
    default_handler.clone().ok_or_else(|| AnalysisError::ConfigInvalid {
        detail: format!(
            "vector {vector_index} at {address:#010x} has no symbol and \
             no default_handler is configured"
        ),
    })
}

/// The set of entrypoints that may preempt `e`, per spec.md §4.E: strictly
/// lower `priority_group`, and enabled.
pub fn preempters<'a>(
    e: &Entrypoint,
    all: &'a [Entrypoint],
) -> Vec<&'a Entrypoint> {
    all.iter()
        .filter(|p| p.enabled && p.priority_group < e.priority_group)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{Symbol, SymbolKind};
    use std::collections::BTreeMap;

    fn image_with_reset(handler_addr: u32) -> Image {
        let mut symbols = BTreeMap::new();
        symbols.insert(
            "Reset".to_string(),
            Symbol {
                address: handler_addr,
                size: 4,
                kind: SymbolKind::Function,
                thumb: true,
            },
        );
        let mut image = crate::loader::test_support::image_with_symbols(symbols);
        // word 0: initial SP, word 1: reset, words 2-3: NMI/HardFault (no
        // symbol; fall back to `default_handler` in tests that enable them).
        image.vector_table =
            vec![0x2000_0000, handler_addr | 1, handler_addr | 1, handler_addr | 1];
        image
    }

    #[test]
    fn reset_is_always_present_at_lowest_priority() {
        let image = image_with_reset(0x1000);
        let config = Config::absent();
        let eps = derive(&image, &config).unwrap();
        let reset = eps.iter().find(|e| e.name == "reset").unwrap();
        assert_eq!(reset.priority_group, i32::MAX);
        assert_eq!(reset.handler, "Reset");
    }

    #[test]
    fn nmi_outranks_everything() {
        let image = image_with_reset(0x1000);
        let mut config = Config::absent();
        config.nmi = Some(5); // whatever is configured, NMI still preempts all
        let eps = derive(&image, &config).unwrap();
        let nmi = eps.iter().find(|e| e.name == "nmi").unwrap();
        let reset = eps.iter().find(|e| e.name == "reset").unwrap();
        assert!(preempters(reset, &eps).iter().any(|p| p.name == "nmi"));
        assert_eq!(nmi.priority_group, i32::MIN);
    }
}
