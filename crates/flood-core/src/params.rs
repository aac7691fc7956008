use std::fmt::Display;

/// Echo one effective parameter to stdout, e.g. `PARAM: connections=100`.
/// Every binary reports its full configuration this way before doing any I/O.
pub fn report<T: Display>(name: &str, value: T) {
    println!("PARAM: {name}={value}");
}

/// Braced comma list for list-valued parameters, e.g. `{9999,10000}`.
pub fn list<T: Display>(values: &[T]) -> String {
    let mut out = String::from("{");
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&value.to_string());
    }
    out.push('}');
    out
}

/// Quoted form for string-valued parameters, e.g. `"127.0.0.1"`.
pub fn quoted<T: Display>(value: T) -> String {
    format!("\"{value}\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_is_braced_and_comma_separated() {
        assert_eq!(list(&[9999u16, 10000]), "{9999,10000}");
        assert_eq!(list(&[7u16]), "{7}");
        assert_eq!(list::<u16>(&[]), "{}");
    }

    #[test]
    fn quoted_wraps_the_value() {
        assert_eq!(quoted("127.0.0.1"), "\"127.0.0.1\"");
    }
}
