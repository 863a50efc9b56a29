/// Demangle a Rust (legacy or v0) or Itanium C++ symbol name. Anything
/// that fails to demangle is returned unchanged.
pub fn demangle(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{demangled:#}");
    }

    if name.starts_with("_Z") || name.starts_with("__Z") {
        let options = cpp_demangle::DemangleOptions::default().no_return_type();
        if let Ok(symbol) = cpp_demangle::Symbol::new(name) {
            if let Ok(demangled) = symbol.demangle_with_options(&options) {
                return demangled;
            }
        }
    }

    name.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn itanium() {
        assert_eq!(demangle("_Z3fooi"), "foo(int)");
    }

    #[test]
    fn rust_legacy_drops_the_hash() {
        assert_eq!(demangle("_ZN4main4main17he714a2e23ed7db23E"), "main::main");
    }

    #[test]
    fn rust_v0() {
        assert_eq!(demangle("_RNvC6_123foo3bar"), "123foo::bar");
    }

    #[test]
    fn unmangled_names_pass_through() {
        assert_eq!(demangle("_"), "_");
        assert_eq!(demangle("read"), "read");
        assert_eq!(demangle(""), "");
    }
}
