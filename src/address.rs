// src/address.rs - Tag address resolution
use crate::error::{PlcError, Result};
use crate::protocols::cip::epath;
use serde::Serialize;

/// Resolved protocol address of a tag
///
/// Built once when the tag is created and never changed afterwards.
///
/// # Examples
///
/// ```rust
/// use vesta::address::TagAddress;
///
/// let addr = TagAddress::parse("DINT_tagname.9", None)?;
/// assert_eq!(addr.segments(), ["DINT_tagname"]);
/// assert_eq!(addr.bit_index(), Some(9));
/// # Ok::<(), vesta::PlcError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagAddress {
    program: Option<String>,
    segments: Vec<String>,
    bit_index: Option<u8>,
    #[serde(skip)]
    path: Vec<u8>,
}

impl TagAddress {
    /// Resolve a tag name, with an optional explicit program scope.
    ///
    /// Accepted forms: `member[.member]*`, array indexes `[i]` / `[i,j]`,
    /// a trailing numeric `.n` bit index, and a `Program:<p>:` or `<p>:`
    /// scope prefix when `program` is not given.
    pub fn parse(name: &str, program: Option<&str>) -> Result<Self> {
        let name = name.trim();
        let (scope, rest) = split_scope(name, program);
        if rest.is_empty() {
            return Err(PlcError::Validation(format!("Invalid tag name '{}'", name)));
        }

        let (rest, bit_index) = split_bit(rest)?;

        let segments: Vec<String> = rest
            .split(['.', '[', ']', ','])
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if segments.is_empty() {
            return Err(PlcError::Validation(format!("Invalid tag name '{}'", name)));
        }

        let mut path = Vec::new();
        if let Some(scope) = &scope {
            path.extend(symbol(&format!("Program:{}", scope))?);
        }
        for segment in &segments {
            match segment.parse::<u32>() {
                Ok(index) => path.extend(epath::element(index)),
                Err(_) => path.extend(symbol(segment)?),
            }
        }
        if path.len() > epath::MAX_PATH_LEN {
            return Err(PlcError::Validation(format!(
                "Tag name '{}' encodes to {} path bytes, the limit is {}",
                name,
                path.len(),
                epath::MAX_PATH_LEN
            )));
        }

        Ok(Self {
            program: scope,
            segments,
            bit_index,
            path,
        })
    }

    pub fn program(&self) -> Option<&str> {
        self.program.as_deref()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn bit_index(&self) -> Option<u8> {
        self.bit_index
    }

    /// Encoded EPATH bytes
    pub fn path(&self) -> &[u8] {
        &self.path
    }

    /// Stable key identifying the addressed memory, bit excluded
    pub fn key(&self) -> String {
        match &self.program {
            Some(p) => format!("Program:{}.{}", p, self.segments.join(".")),
            None => self.segments.join("."),
        }
    }
}

fn symbol(name: &str) -> Result<Vec<u8>> {
    if name.len() > epath::MAX_SYMBOL_LEN {
        return Err(PlcError::Validation(format!(
            "Tag member is {} bytes long, the limit is {}",
            name.len(),
            epath::MAX_SYMBOL_LEN
        )));
    }
    Ok(epath::symbolic(name))
}

fn split_scope<'a>(name: &'a str, program: Option<&str>) -> (Option<String>, &'a str) {
    if let Some(p) = program.filter(|p| !p.is_empty()) {
        return (Some(p.to_string()), name);
    }
    let unprefixed = name.strip_prefix("Program:").unwrap_or(name);
    match unprefixed.split_once(':') {
        Some((scope, rest)) if !scope.is_empty() => (Some(scope.to_string()), rest),
        _ => (None, name),
    }
}

fn split_bit(rest: &str) -> Result<(&str, Option<u8>)> {
    match rest.rsplit_once('.') {
        Some((head, tail)) if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) => {
            let bit = tail
                .parse::<u8>()
                .map_err(|_| PlcError::Validation(format!("Invalid bit index '{}'", tail)))?;
            Ok((head, Some(bit)))
        }
        _ => Ok((rest, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_bit_is_stripped() {
        let addr = TagAddress::parse("DINT_tagname.9", None).unwrap();
        assert_eq!(addr.bit_index(), Some(9));
        assert_eq!(addr.segments(), ["DINT_tagname"]);
        assert_eq!(addr.path(), epath::symbolic("DINT_tagname").as_slice());
    }

    #[test]
    fn test_scoped_without_bit() {
        let addr = TagAddress::parse("prog1:DINT_tagname", None).unwrap();
        assert_eq!(addr.bit_index(), None);
        assert_eq!(addr.program(), Some("prog1"));

        let mut expected = epath::symbolic("Program:prog1");
        expected.extend(epath::symbolic("DINT_tagname"));
        assert_eq!(addr.path(), expected.as_slice());
    }

    #[test]
    fn test_program_prefix_and_explicit_scope_agree() {
        let a = TagAddress::parse("Program:main:Counter", None).unwrap();
        let b = TagAddress::parse("Counter", Some("main")).unwrap();
        assert_eq!(a.path(), b.path());
        assert_eq!(a.key(), "Program:main.Counter");
    }

    #[test]
    fn test_array_and_member_path() {
        let addr = TagAddress::parse("Line[2,3].Motor.Speed.4", None).unwrap();
        assert_eq!(addr.bit_index(), Some(4));
        assert_eq!(addr.segments(), ["Line", "2", "3", "Motor", "Speed"]);

        let mut expected = epath::symbolic("Line");
        expected.extend(epath::element(2));
        expected.extend(epath::element(3));
        expected.extend(epath::symbolic("Motor"));
        expected.extend(epath::symbolic("Speed"));
        assert_eq!(addr.path(), expected.as_slice());
    }

    #[test]
    fn test_array_index_is_not_a_bit() {
        let addr = TagAddress::parse("Values[10]", None).unwrap();
        assert_eq!(addr.bit_index(), None);
        assert_eq!(addr.segments(), ["Values", "10"]);
    }

    #[test]
    fn test_oversized_names_rejected() {
        let member = "m".repeat(epath::MAX_SYMBOL_LEN);
        assert!(TagAddress::parse(&member, None).is_ok());

        let err = TagAddress::parse(&"m".repeat(256), None).unwrap_err();
        assert!(matches!(err, PlcError::Validation(_)), "{}", err);

        // 202 path bytes per member: two fit, three overflow.
        let member = "m".repeat(200);
        let two = format!("{0}.{0}", member);
        assert!(TagAddress::parse(&two, None).is_ok());
        let three = format!("{0}.{0}.{0}", member);
        let err = TagAddress::parse(&three, None).unwrap_err();
        assert!(err.to_string().contains("the limit is 510"), "{}", err);
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(TagAddress::parse("  ", None).is_err());
        assert!(TagAddress::parse("prog:", None).is_err());
    }
}
