// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Config loader.
//!
//! Strict JSON (`deny_unknown_fields`), gated by a version number, resolved
//! against the loaded image's symbol table so a bad hint or handler name is
//! caught here rather than surfacing later as a confusing `DanglingCall`.

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::callgraph::CallHints;
use crate::error::AnalysisError;
use crate::loader::Image;

const SUPPORTED_VERSION: u64 = 1;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    stack_depth_analyzer_version: u64,
    #[serde(default)]
    entrypoints: RawEntrypoints,
    #[serde(default)]
    dynamic_calls: Vec<RawDynamicCall>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawEntrypoints {
    default_handler: Option<String>,
    nmi: Option<Value>,
    hardfault: Option<Value>,
    svcall: Option<Value>,
    pendsv: Option<Value>,
    systick: Option<Value>,
    interrupts: Vec<RawInterrupt>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawInterrupt {
    number: u32,
    name: String,
    #[serde(default)]
    config: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDynamicCall {
    site: String,
    targets: Vec<String>,
}

/// One external-interrupt entrypoint, already resolved to a priority group
/// (or pruned, if disabled).
#[derive(Clone, Debug)]
pub struct InterruptConfig {
    pub number: u32,
    pub name: String,
    pub priority_group: i32,
}

/// Fully resolved configuration: every `<priority-group> | false | null`
/// slot has already been collapsed to `Option<i32>` (`None` = pruned).
#[derive(Clone, Debug)]
pub struct Config {
    pub default_handler: Option<String>,
    pub nmi: Option<i32>,
    pub hardfault: Option<i32>,
    pub svcall: Option<i32>,
    pub pendsv: Option<i32>,
    pub systick: Option<i32>,
    pub interrupts: Vec<InterruptConfig>,
    pub dynamic_calls: CallHints,
}

impl Config {
    /// The config used when no `<config-path>` is given: every fixed
    /// system exception is enabled at priority group 0, no interrupts and
    /// no dynamic-call hints (spec.md §6).
    fn absent() -> Config {
        Config {
            default_handler: None,
            nmi: Some(0),
            hardfault: Some(0),
            svcall: Some(0),
            pendsv: Some(0),
            systick: Some(0),
            interrupts: Vec::new(),
            dynamic_calls: CallHints::new(),
        }
    }
}

pub fn load(
    path: Option<&Path>,
    image: &Image,
) -> Result<Config, AnalysisError> {
    let Some(path) = path else {
        return Ok(Config::absent());
    };

    let text = std::fs::read_to_string(path).map_err(|e| {
        AnalysisError::ConfigInvalid {
            detail: format!("could not read {}: {e}", path.display()),
        }
    })?;
    let raw: RawConfig = serde_json::from_str(&text).map_err(|e| {
        AnalysisError::ConfigInvalid {
            detail: format!("{}: {e}", path.display()),
        }
    })?;

    if raw.stack_depth_analyzer_version != SUPPORTED_VERSION {
        return Err(AnalysisError::ConfigInvalid {
            detail: format!(
                "unsupported stack_depth_analyzer_version {} (expected {})",
                raw.stack_depth_analyzer_version, SUPPORTED_VERSION
            ),
        });
    }

    let entrypoints = raw.entrypoints;
    let nmi = resolve_scalar_priority("nmi", entrypoints.nmi)?;
    let hardfault = resolve_scalar_priority("hardfault", entrypoints.hardfault)?;
    let svcall = resolve_scalar_priority("svcall", entrypoints.svcall)?;
    let pendsv = resolve_scalar_priority("pendsv", entrypoints.pendsv)?;
    let systick = resolve_scalar_priority("systick", entrypoints.systick)?;

    let mut interrupts = Vec::new();
    for irq in entrypoints.interrupts {
        if let Some(priority_group) =
            resolve_object_priority(&irq.name, irq.config)?
        {
            interrupts.push(InterruptConfig {
                number: irq.number,
                name: irq.name,
                priority_group,
            });
        }
    }

    let mut dynamic_calls = CallHints::new();
    for call in raw.dynamic_calls {
        let site = resolve_site(&call.site, image)?;
        for target in &call.targets {
            if !image.symbols.contains_key(target) {
                return Err(AnalysisError::ConfigInvalid {
                    detail: format!(
                        "dynamic_calls target `{target}` is not a known symbol"
                    ),
                });
            }
        }
        dynamic_calls.entry(site).or_default().extend(call.targets);
    }

    Ok(Config {
        default_handler: entrypoints.default_handler,
        nmi,
        hardfault,
        svcall,
        pendsv,
        systick,
        interrupts,
        dynamic_calls,
    })
}

/// Resolves a `<priority-group> | false | null` slot (the fixed system
/// exceptions' schema).
fn resolve_scalar_priority(
    field: &str,
    value: Option<Value>,
) -> Result<Option<i32>, AnalysisError> {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .ok_or_else(|| AnalysisError::ConfigInvalid {
                detail: format!("{field}: priority group out of range"),
            })
            .map(Some),
        other => Err(AnalysisError::ConfigInvalid {
            detail: format!("{field}: expected an integer, false, or null, got {other:?}"),
        }),
    }
}

/// Resolves an interrupt's `{ "priority_group": <int> } | false | null`
/// slot.
fn resolve_object_priority(
    name: &str,
    value: Option<Value>,
) -> Result<Option<i32>, AnalysisError> {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(None),
        Some(Value::Object(map)) => {
            let Some(pg) = map.get("priority_group") else {
                return Err(AnalysisError::ConfigInvalid {
                    detail: format!(
                        "interrupt `{name}`: config object missing priority_group"
                    ),
                });
            };
            resolve_scalar_priority(&format!("{name}.priority_group"), Some(pg.clone()))
        }
        other => Err(AnalysisError::ConfigInvalid {
            detail: format!(
                "interrupt `{name}`: expected an object, false, or null, got {other:?}"
            ),
        }),
    }
}

/// Resolves a dynamic-call `site` specifier: a hex address, or
/// `<symbol>+<offset>`, or a bare symbol name.
fn resolve_site(site: &str, image: &Image) -> Result<u32, AnalysisError> {
    if let Some(hex) = site.strip_prefix("0x") {
        return u32::from_str_radix(hex, 16).map_err(|_| {
            AnalysisError::ConfigInvalid {
                detail: format!("dynamic_calls site `{site}` is not valid hex"),
            }
        });
    }
    if let Some((name, offset)) = site.split_once('+') {
        let base = image.symbols.get(name).ok_or_else(|| {
            AnalysisError::ConfigInvalid {
                detail: format!("dynamic_calls site references unknown symbol `{name}`"),
            }
        })?;
        let offset = offset.strip_prefix("0x").map_or_else(
            || offset.parse::<u32>(),
            |hex| u32::from_str_radix(hex, 16),
        );
        let offset = offset.map_err(|_| AnalysisError::ConfigInvalid {
            detail: format!("dynamic_calls site `{site}` has an invalid offset"),
        })?;
        return Ok(base.address + offset);
    }
    image
        .symbols
        .get(site)
        .map(|s| s.address)
        .ok_or_else(|| AnalysisError::ConfigInvalid {
            detail: format!("dynamic_calls site `{site}` is not a known symbol"),
        })
}
