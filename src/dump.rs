//! Human-readable listing of a document, for debugging stored data.
//!
//! Each node gets one line: its offset, indentation by depth, its name and total size, and for
//! leaves a best guess at the payload's value. The payload type isn't stored, so the guess is
//! made from the payload length alone:
//!
//! ```text
//! (0000)    [ Root , 117 ]
//! (0008)      [ Meta , 20 ]
//! (0016)        [ FileVersion , 12 ]: 0 / 0.00
//! (0028)      [ Data , 32 ]
//! (0036)        [ Height , 12 ]: 6 / 0.00
//! (0048)        [ Width , 12 ]: 1075000115 / 2.30
//! ```

use std::fmt::Write;

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    dictionary::NameDictionary,
    error::Result,
    leaf::decode_text,
    node::{NodeKind, ReservedId},
    serializer::{LoadMode, TreeSerializer},
    walk::{NodeWalker, WalkedNode},
};

/// Render a document as text.
///
/// The raw node structure is walked first, then the walk is repeated with the document's
/// dictionary so user tags show up by name. If either pass fails, the output starts with the
/// error and contains everything both passes managed to render. This never fails, so it can be
/// used on arbitrary bytes.
pub fn to_debug_string(data: &[u8]) -> String {
    let mut raw = String::new();
    let mut named = String::new();

    let result =
        render(data, LoadMode::Raw, &mut raw).and_then(|_| render(data, LoadMode::Normal, &mut named));
    match result {
        Ok(()) => named,
        Err(e) => {
            log::debug!("debug dump stopped early: {}", e);
            let mut out = format!("!!! {} !!!\n\n", e);
            if !named.is_empty() {
                out.push_str(&named);
                out.push_str("\n\n");
            }
            out.push_str(&raw);
            out
        }
    }
}

/// Append one line per node to `out`. `LoadMode::Normal` loads the dictionary first so user
/// tags can be shown by name.
fn render(data: &[u8], mode: LoadMode, out: &mut String) -> Result<()> {
    let names = match mode {
        LoadMode::Raw => None,
        LoadMode::Normal => {
            let mut ser = TreeSerializer::new();
            ser.begin_loading(data)?;
            let names = ser.dictionary().clone();
            ser.end_loading()?;
            Some(names)
        }
    };

    for (i, node) in NodeWalker::new(data).enumerate() {
        let node = node?;
        if i > 0 {
            out.push('\n');
        }
        write_line(out, &node, names.as_ref());
    }
    Ok(())
}

fn write_line(out: &mut String, node: &WalkedNode, names: Option<&NameDictionary>) {
    // Writing into a String can't fail
    let _ = write!(
        out,
        "({:04})    {}[ {} , {} ]",
        node.offset,
        "  ".repeat(node.depth),
        node_name(node.header.id, names),
        node.header.size
    );
    if node.header.kind == NodeKind::Leaf {
        out.push_str(": ");
        write_payload(out, node.payload);
    }
}

fn node_name(id: i16, names: Option<&NameDictionary>) -> String {
    if let Some(reserved) = ReservedId::from_id(id).filter(|r| *r != ReservedId::Invalid) {
        return reserved.name().to_string();
    }
    match names {
        None => id.to_string(),
        Some(names) => match names.name_of(id) {
            Some("") => "\"\"".to_string(),
            Some(name) => name.to_string(),
            None => format!("{} (not found)", id),
        },
    }
}

fn write_payload(out: &mut String, payload: &[u8]) {
    let _ = match payload.len() {
        0 => write!(out, "[null]"),
        1 => write!(out, "{}", payload[0]),
        2 => write!(out, "{}", LittleEndian::read_i16(payload)),
        4 => write!(
            out,
            "{} / {:.2}",
            LittleEndian::read_i32(payload),
            LittleEndian::read_f32(payload)
        ),
        8 => write!(out, "{}", LittleEndian::read_f64(payload)),
        _ => match decode_text(payload) {
            Ok(text) => write!(out, "\"{}\"", text),
            Err(_) => {
                let bytes: Vec<String> = payload.iter().map(|b| b.to_string()).collect();
                write!(out, "{}", bytes.join(" "))
            }
        },
    };
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::{NodeHeader, HEADER_SIZE};

    fn save(f: impl FnOnce(&mut TreeSerializer)) -> Vec<u8> {
        let mut ser = TreeSerializer::new();
        ser.begin_saving().unwrap();
        f(&mut ser);
        ser.end_saving().unwrap()
    }

    #[test]
    fn int_and_float() {
        let bytes = save(|ser| {
            ser.serialize("Height", &mut 6i32, 1).unwrap();
            ser.serialize("Width", &mut 2.3f32, 1.0).unwrap();
        });
        let dump = to_debug_string(&bytes);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines[0], format!("(0000)    [ Root , {} ]", bytes.len()));
        assert_eq!(lines[1], "(0008)      [ Meta , 20 ]");
        assert_eq!(lines[2], "(0016)        [ FileVersion , 12 ]: 0 / 0.00");
        assert_eq!(lines[3], "(0028)      [ Data , 32 ]");
        assert_eq!(lines[4], "(0036)        [ Height , 12 ]: 6 / 0.00");
        assert_eq!(
            lines[5],
            format!("(0048)        [ Width , 12 ]: {} / 2.30", 2.3f32.to_bits())
        );
        assert_eq!(lines[6], "(0060)      [ Dictionary , 57 ]");
        assert_eq!(lines[7], "(0068)        [ Key , 15 ]: \"Height\"");
        assert_eq!(lines[8], "(0083)        [ Value , 10 ]: 1");
        assert!(!dump.ends_with('\n'));
    }

    #[test]
    fn list_of_ints() {
        let bytes = save(|ser| {
            ser.serialize_list("laLista", &mut vec![10i32, 20, 30])
                .unwrap();
        });
        let dump = to_debug_string(&bytes);
        assert!(dump.contains("      [ laLista , 56 ]\n"));
        assert!(dump.contains("        [ _ElemCount , 12 ]: 3 / 0.00\n"));
        for v in [10, 20, 30] {
            assert!(dump.contains(&format!("        [ _Elem , 12 ]: {} / 0.00\n", v)));
        }
    }

    #[test]
    fn payload_guesses() {
        let bytes = save(|ser| {
            ser.serialize("short", &mut -2i16, 0).unwrap();
            ser.serialize("double", &mut 0.5f64, 0.0).unwrap();
            ser.serialize("byte", &mut true, false).unwrap();
            ser.serialize("text", &mut "hello".to_string(), String::new())
                .unwrap();
            ser.serialize("", &mut 1i32, 0).unwrap();
            let mut raw = serde_bytes::ByteBuf::from(vec![1u8, 2, 3]);
            ser.serialize("raw", &mut raw, Default::default()).unwrap();
            ser.serialize_object::<Empty>("null", &mut None, Default::default())
                .unwrap();
        });
        let dump = to_debug_string(&bytes);
        assert!(dump.contains("[ short , 10 ]: -2\n"));
        assert!(dump.contains("[ double , 16 ]: 0.5\n"));
        assert!(dump.contains("[ byte , 9 ]: 1\n"));
        assert!(dump.contains("[ text , 14 ]: \"hello\"\n"));
        assert!(dump.contains("[ \"\" , 12 ]: 1 / 0.00\n"));
        assert!(dump.contains("[ raw , 11 ]: 1 2 3\n"));
        assert!(dump.contains("[ null , 8 ]: [null]\n"));
    }

    #[derive(Default)]
    struct Empty;

    impl crate::TreeSerializable for Empty {
        fn serialize(&mut self, _: &mut TreeSerializer) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn unknown_id() {
        let mut bytes = save(|ser| {
            ser.serialize("a", &mut 1i32, 0).unwrap();
        });
        // Rename the data leaf to an id missing from the dictionary
        let leaf = HEADER_SIZE + 2 * HEADER_SIZE + 4 + HEADER_SIZE;
        assert_eq!(NodeHeader::decode(&bytes, leaf).unwrap().id, 1);
        bytes[leaf..leaf + 2].copy_from_slice(&9i16.to_le_bytes());
        let dump = to_debug_string(&bytes);
        assert!(dump.contains("[ 9 (not found) , 12 ]: 1 / 0.00"));
    }

    #[test]
    fn broken_document() {
        let mut bytes = save(|ser| {
            ser.serialize("a", &mut 1i32, 0).unwrap();
        });
        // Give the last dictionary value an unknown kind code
        let last = bytes.len() - HEADER_SIZE - 2;
        bytes[last + 6] = 5;
        let dump = to_debug_string(&bytes);
        assert!(dump.starts_with("!!! "));
        // The raw pass still lists nodes it could read, by id
        assert!(dump.contains("(0000)    [ Root , "));
        assert!(dump.contains("[ 1 , 12 ]: 1 / 0.00"));
        assert!(to_debug_string(&[]).starts_with("!!! "));
        assert!(to_debug_string(&[1, 2, 3]).starts_with("!!! "));
    }
}
