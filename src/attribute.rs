//! The attribute bus: string-keyed, type-tagged option access.
//!
//! Every settable option has a declared type; setting validates the value
//! against it and writes through to [`CacheOptions`](crate::config::CacheOptions).
//! Some attributes carry side effects (memory trims, file close-downs,
//! whole-cache invalidation), reported to the caller as a [`SideEffect`]
//! so the cache can apply them outside the attribute lock.

use crate::config::CacheOptions;
use crate::error::CacheError;

// =============================================================================
// Values and Types
// =============================================================================

/// A dynamically typed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i32),
    Int64(i64),
    Float(f32),
    Str(String),
    StrVec(Vec<String>),
    IntVec(Vec<i32>),
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> AttrValue {
        AttrValue::Int(v)
    }
}
impl From<i64> for AttrValue {
    fn from(v: i64) -> AttrValue {
        AttrValue::Int64(v)
    }
}
impl From<f32> for AttrValue {
    fn from(v: f32) -> AttrValue {
        AttrValue::Float(v)
    }
}
impl From<f64> for AttrValue {
    fn from(v: f64) -> AttrValue {
        AttrValue::Float(v as f32)
    }
}
impl From<bool> for AttrValue {
    fn from(v: bool) -> AttrValue {
        AttrValue::Int(v as i32)
    }
}
impl From<&str> for AttrValue {
    fn from(v: &str) -> AttrValue {
        AttrValue::Str(v.to_string())
    }
}
impl From<String> for AttrValue {
    fn from(v: String) -> AttrValue {
        AttrValue::Str(v)
    }
}

impl AttrValue {
    /// Coerce to int, accepting a float with an integral value.
    fn as_int(&self) -> Option<i32> {
        match self {
            AttrValue::Int(v) => Some(*v),
            AttrValue::Float(v) if v.fract() == 0.0 => Some(*v as i32),
            _ => None,
        }
    }

    /// Coerce to float, accepting an int.
    fn as_float(&self) -> Option<f32> {
        match self {
            AttrValue::Float(v) => Some(*v),
            AttrValue::Int(v) => Some(*v as f32),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

/// Declared type of an attribute name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    Int,
    Int64,
    Float,
    Str,
    StrVec,
    IntVec,
    Unknown,
}

/// Declared type of a settable attribute, or `Unknown`.
pub fn declared_type(name: &str) -> AttrType {
    match name {
        "max_open_files"
        | "max_open_files_strict"
        | "autotile"
        | "autoscanline"
        | "automip"
        | "accept_untiled"
        | "accept_unmipped"
        | "forcefloat"
        | "failure_retries"
        | "deduplicate"
        | "unassociatedalpha"
        | "max_errors_per_file"
        | "trust_file_extensions"
        | "statistics:level" => AttrType::Int,
        "max_memory_MB" => AttrType::Float,
        "searchpath" | "plugin_searchpath" | "substitute_image" | "colorspace" | "colorconfig"
        | "options" => AttrType::Str,
        // Read-only statistics.
        "total_files" | "stat:tiles_created" | "stat:tiles_current" | "stat:tiles_peak"
        | "stat:open_files_created" | "stat:open_files_current" | "stat:open_files_peak"
        | "stat:unique_files" => AttrType::Int,
        "stat:cache_footprint" | "stat:cache_memory_used" | "stat:find_tile_calls"
        | "stat:image_size" | "stat:file_size" | "stat:bytes_read" => AttrType::Int64,
        "stat:fileio_time" | "stat:fileopen_time" | "stat:file_locking_time"
        | "stat:tile_locking_time" | "stat:find_file_time" | "stat:find_tile_time" => {
            AttrType::Float
        }
        "all_filenames" => AttrType::StrVec,
        _ => AttrType::Unknown,
    }
}

// =============================================================================
// Set / Get
// =============================================================================

/// Deferred consequence of setting an attribute, applied by the cache
/// after the options lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    None,
    /// Evict tiles down to the (new) memory budget.
    TrimMemory,
    /// Close open files down to the (new) cap.
    CloseFiles,
    /// Invalidate every cached file and tile.
    InvalidateAll,
}

fn set_bool(slot: &mut bool, value: &AttrValue, name: &str) -> Result<(), CacheError> {
    *slot = value
        .as_int()
        .ok_or_else(|| CacheError::InvalidAttribute(format!("{name} takes an int")))?
        != 0;
    Ok(())
}

fn set_int(slot: &mut i32, value: &AttrValue, name: &str) -> Result<(), CacheError> {
    *slot = value
        .as_int()
        .ok_or_else(|| CacheError::InvalidAttribute(format!("{name} takes an int")))?;
    Ok(())
}

fn set_str(slot: &mut String, value: &AttrValue, name: &str) -> Result<(), CacheError> {
    *slot = value
        .as_str()
        .ok_or_else(|| CacheError::InvalidAttribute(format!("{name} takes a string")))?
        .to_string();
    Ok(())
}

/// Validate and apply one attribute to the option struct. The `"options"`
/// pseudo-attribute recursively applies a `name=value` list; the strongest
/// side effect among its entries wins.
pub fn apply(
    options: &mut CacheOptions,
    name: &str,
    value: &AttrValue,
) -> Result<SideEffect, CacheError> {
    let mut effect = SideEffect::None;
    match name {
        "max_open_files" => {
            set_int(&mut options.max_open_files, value, name)?;
            effect = SideEffect::CloseFiles;
        }
        "max_open_files_strict" => set_bool(&mut options.max_open_files_strict, value, name)?,
        "max_memory_MB" => {
            options.max_memory_mb = value
                .as_float()
                .ok_or_else(|| CacheError::InvalidAttribute("max_memory_MB takes a float".into()))?;
            effect = SideEffect::TrimMemory;
        }
        "searchpath" => set_str(&mut options.searchpath, value, name)?,
        "plugin_searchpath" => set_str(&mut options.plugin_searchpath, value, name)?,
        "autotile" => set_int(&mut options.autotile, value, name)?,
        "autoscanline" => set_bool(&mut options.autoscanline, value, name)?,
        "automip" => set_bool(&mut options.automip, value, name)?,
        "accept_untiled" => set_bool(&mut options.accept_untiled, value, name)?,
        "accept_unmipped" => set_bool(&mut options.accept_unmipped, value, name)?,
        "forcefloat" => set_bool(&mut options.forcefloat, value, name)?,
        "failure_retries" => set_int(&mut options.failure_retries, value, name)?,
        "deduplicate" => set_bool(&mut options.deduplicate, value, name)?,
        "substitute_image" => set_str(&mut options.substitute_image, value, name)?,
        "unassociatedalpha" => set_bool(&mut options.unassociatedalpha, value, name)?,
        "max_errors_per_file" => set_int(&mut options.max_errors_per_file, value, name)?,
        "trust_file_extensions" => set_bool(&mut options.trust_file_extensions, value, name)?,
        "colorspace" => {
            let new = value
                .as_str()
                .ok_or_else(|| CacheError::InvalidAttribute("colorspace takes a string".into()))?;
            if new != options.colorspace {
                options.colorspace = new.to_string();
                effect = SideEffect::InvalidateAll;
            }
        }
        "colorconfig" => set_str(&mut options.colorconfig, value, name)?,
        "statistics:level" => set_int(&mut options.statistics_level, value, name)?,
        "options" => {
            let list = value
                .as_str()
                .ok_or_else(|| CacheError::InvalidAttribute("options takes a string".into()))?;
            for (k, v) in parse_options(list)? {
                let parsed = coerce_for(&k, &v)?;
                let e = apply(options, &k, &parsed)?;
                effect = strongest(effect, e);
            }
        }
        _ => {
            return Err(CacheError::InvalidAttribute(format!(
                "unknown attribute \"{name}\""
            )))
        }
    }
    options.sanitize();
    Ok(effect)
}

/// Read a settable attribute back out of the option struct.
pub fn get(options: &CacheOptions, name: &str) -> Option<AttrValue> {
    Some(match name {
        "max_open_files" => AttrValue::Int(options.max_open_files),
        "max_open_files_strict" => AttrValue::Int(options.max_open_files_strict as i32),
        "max_memory_MB" => AttrValue::Float(options.max_memory_mb),
        "searchpath" => AttrValue::Str(options.searchpath.clone()),
        "plugin_searchpath" => AttrValue::Str(options.plugin_searchpath.clone()),
        "autotile" => AttrValue::Int(options.autotile),
        "autoscanline" => AttrValue::Int(options.autoscanline as i32),
        "automip" => AttrValue::Int(options.automip as i32),
        "accept_untiled" => AttrValue::Int(options.accept_untiled as i32),
        "accept_unmipped" => AttrValue::Int(options.accept_unmipped as i32),
        "forcefloat" => AttrValue::Int(options.forcefloat as i32),
        "failure_retries" => AttrValue::Int(options.failure_retries),
        "deduplicate" => AttrValue::Int(options.deduplicate as i32),
        "substitute_image" => AttrValue::Str(options.substitute_image.clone()),
        "unassociatedalpha" => AttrValue::Int(options.unassociatedalpha as i32),
        "max_errors_per_file" => AttrValue::Int(options.max_errors_per_file),
        "trust_file_extensions" => AttrValue::Int(options.trust_file_extensions as i32),
        "colorspace" => AttrValue::Str(options.colorspace.clone()),
        "colorconfig" => AttrValue::Str(options.colorconfig.clone()),
        "statistics:level" => AttrValue::Int(options.statistics_level),
        _ => return None,
    })
}

fn strongest(a: SideEffect, b: SideEffect) -> SideEffect {
    use SideEffect::*;
    match (a, b) {
        (InvalidateAll, _) | (_, InvalidateAll) => InvalidateAll,
        (CloseFiles, _) | (_, CloseFiles) => CloseFiles,
        (TrimMemory, _) | (_, TrimMemory) => TrimMemory,
        _ => None,
    }
}

/// Parse a textual value according to the target attribute's declared type.
fn coerce_for(name: &str, raw: &str) -> Result<AttrValue, CacheError> {
    match declared_type(name) {
        AttrType::Int => raw
            .parse::<i32>()
            .map(AttrValue::Int)
            .map_err(|_| CacheError::InvalidAttribute(format!("{name}: \"{raw}\" is not an int"))),
        AttrType::Float => raw.parse::<f32>().map(AttrValue::Float).map_err(|_| {
            CacheError::InvalidAttribute(format!("{name}: \"{raw}\" is not a float"))
        }),
        AttrType::Str => Ok(AttrValue::Str(raw.to_string())),
        _ => Err(CacheError::InvalidAttribute(format!(
            "unknown attribute \"{name}\""
        ))),
    }
}

// =============================================================================
// Options String
// =============================================================================

/// Parse a comma-separated `name=value` list. Values may be single- or
/// double-quoted to contain commas or the other quote character.
pub fn parse_options(list: &str) -> Result<Vec<(String, String)>, CacheError> {
    let mut out = Vec::new();
    let mut chars = list.chars().peekable();
    loop {
        // Skip separators and whitespace.
        while matches!(chars.peek(), Some(',') | Some(' ') | Some('\t')) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }
        let mut name = String::new();
        for c in chars.by_ref() {
            if c == '=' {
                break;
            }
            name.push(c);
        }
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(CacheError::InvalidAttribute(
                "options list has an empty name".to_string(),
            ));
        }
        let mut value = String::new();
        match chars.peek() {
            Some(&q) if q == '\'' || q == '"' => {
                chars.next();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == q {
                        closed = true;
                        break;
                    }
                    value.push(c);
                }
                if !closed {
                    return Err(CacheError::InvalidAttribute(format!(
                        "unterminated quote in options value for \"{name}\""
                    )));
                }
            }
            _ => {
                while let Some(&c) = chars.peek() {
                    if c == ',' {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
                value = value.trim_end().to_string();
            }
        }
        out.push((name, value));
    }
    Ok(out)
}
