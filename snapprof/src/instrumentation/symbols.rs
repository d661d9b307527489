//! Symbolization of raw instruction pointers
//!
//! Shared by the heap profile encoder and the thread dump. Addresses are
//! return addresses, so lookups use `ip - 1` to land inside the call.

use std::path::Path;

/// One resolved (possibly inlined) function at an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFrame {
    pub name: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// Resolve `ip` to its frames, innermost inlined function first
///
/// Unknown addresses yield a single frame named after the address.
#[must_use]
pub fn resolve(ip: usize) -> Vec<ResolvedFrame> {
    let mut frames = Vec::new();
    let lookup = ip.saturating_sub(1);
    backtrace::resolve(lookup as *mut std::ffi::c_void, |symbol| {
        let name = symbol
            .name()
            .and_then(|name| name.as_str().map(demangle))
            .unwrap_or_else(|| format!("{ip:#x}"));
        frames.push(ResolvedFrame {
            name,
            file: symbol.filename().map(|p: &Path| p.display().to_string()),
            line: symbol.lineno(),
        });
    });
    if frames.is_empty() {
        frames.push(ResolvedFrame { name: format!("{ip:#x}"), file: None, line: None });
    }
    frames
}

/// Demangle a Rust symbol without its hash suffix; other symbols pass through
#[must_use]
pub fn demangle(raw: &str) -> String {
    match rustc_demangle::try_demangle(raw) {
        Ok(demangled) => format!("{demangled:#}"),
        Err(_) => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demangle_strips_hash() {
        let mangled = "_ZN8snapprof5alloc6sample17h0123456789abcdefE";
        assert_eq!(demangle(mangled), "snapprof::alloc::sample");
        assert_eq!(demangle("memcpy"), "memcpy");
    }

    #[test]
    fn test_resolve_own_function() {
        #[inline(never)]
        fn here() -> usize {
            let mut ip = 0;
            backtrace::trace(|frame| {
                ip = frame.ip() as usize;
                false
            });
            ip
        }
        let frames = resolve(here());
        assert!(!frames.is_empty());
    }
}
