//! EPATH segment builders
//!
//! Only the segment kinds the tester emits are covered: ANSI extended symbolic
//! segments for tag members, element segments for array indexes, logical
//! class/instance segments for object addressing and the backplane port
//! segment used in the Unconnected Send route.

/// Longest name a symbolic segment can carry
pub const MAX_SYMBOL_LEN: usize = 255;
/// Longest EPATH a request header can describe, in bytes
pub const MAX_PATH_LEN: usize = 510;

/// ANSI extended symbolic segment: `0x91`, length, name, pad to even length
pub fn symbolic(name: &str) -> Vec<u8> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() + 3);
    out.push(0x91);
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
    if bytes.len() % 2 == 1 {
        out.push(0x00);
    }
    out
}

/// Member (array element) segment, using the narrowest encoding that fits
pub fn element(index: u32) -> Vec<u8> {
    if index <= 0xFF {
        vec![0x28, index as u8]
    } else if index <= 0xFFFF {
        let b = (index as u16).to_le_bytes();
        vec![0x29, 0x00, b[0], b[1]]
    } else {
        let b = index.to_le_bytes();
        vec![0x2A, 0x00, b[0], b[1], b[2], b[3]]
    }
}

/// 8-bit logical class + instance segments
pub fn logical(class: u8, instance: u8) -> Vec<u8> {
    vec![0x20, class, 0x24, instance]
}

/// Port segment through the backplane (port 1) to a slot
pub fn backplane(slot: u8) -> Vec<u8> {
    vec![0x01, slot]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbolic_padding() {
        assert_eq!(symbolic("ab"), vec![0x91, 2, b'a', b'b']);
        assert_eq!(symbolic("abc"), vec![0x91, 3, b'a', b'b', b'c', 0]);
    }

    #[test]
    fn test_element_widths() {
        assert_eq!(element(5), vec![0x28, 5]);
        assert_eq!(element(0x1234), vec![0x29, 0, 0x34, 0x12]);
        assert_eq!(element(0x12_3456), vec![0x2A, 0, 0x56, 0x34, 0x12, 0]);
    }
}
