#![no_main]
use libfuzzer_sys::fuzz_target;
use tagtree::{
    check_structure, from_bytes, to_debug_string, ObjectFallback, Result, TreeSerializable,
    TreeSerializer,
};

#[derive(Default)]
struct Node {
    value: i32,
    label: String,
    children: Vec<Option<Node>>,
}

impl TreeSerializable for Node {
    fn serialize(&mut self, ser: &mut TreeSerializer) -> Result<()> {
        ser.serialize("value", &mut self.value, 0)?;
        ser.serialize("label", &mut self.label, String::new())?;
        ser.serialize_object_list("children", &mut self.children, ObjectFallback::Default)?;
        Ok(())
    }
}

fuzz_target!(|data: &[u8]| {
    let _ = check_structure(data);
    let _ = to_debug_string(data);
    let _ = from_bytes::<Vec<(String, Option<u64>)>>(data);

    let mut ser = TreeSerializer::new();
    if ser.begin_loading(data).is_ok() {
        let mut root = None;
        if ser.serialize_object::<Node>("root", &mut root, ObjectFallback::Absent).is_ok() {
            let _ = ser.end_loading();
        }
    }
});
