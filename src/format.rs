/*!

Byte layout of a document.

All integers are little-endian.

# Nodes

A document is a tree of nodes. Every node starts with an 8-byte header:

```text
+--------+--------+--------+--------+--------+--------+--------+--------+
|   Id (i16)      |            Size (i32)             |   Kind (u16)    |
+--------+--------+--------+--------+--------+--------+--------+--------+
```

- Id is the tag of the node: a user tag looked up in the document's dictionary, or one of the
    reserved ids below.
- Size is the total size of the node, header included.
- Kind is 0 for a parent node and 1 for a leaf node.

A parent node's body is a sequence of child nodes that must exactly fill it. A leaf node's body
is a raw payload, whose meaning is known only to the code reading it.

# Reserved ids

Ids from `i16::MAX - 100` up are reserved:

| Id             | Name            | Use                                    |
| --             | --              | --                                     |
| `i16::MAX`     | Invalid         | Never stored; marks "no such tag"      |
| `i16::MAX - 1` | Root            | The single top-level node              |
| `i16::MAX - 2` | Meta            | Parent of the file version leaf        |
| `i16::MAX - 3` | FileVersion     | i32 leaf holding the format version    |
| `i16::MAX - 4` | Data            | Parent of all user content             |
| `i16::MAX - 5` | Dictionary      | Parent of the name dictionary          |
| `i16::MAX - 6` | Key             | Text leaf with a tag name              |
| `i16::MAX - 7` | Value           | i16 leaf with the id of the name above |
| `i16::MAX - 20`| IsNull          | Marker for absent values               |

User tags are numbered from 1 in the order they are first written.

# Document

```text
Root
├── Meta
│   └── FileVersion: i32
├── Data
│   └── ... user content ...
└── Dictionary
    ├── Key: text
    ├── Value: i16
    └── ... one pair per user tag ...
```

The dictionary comes last because it's only complete once all content has been written. The
`FileVersion` name is part of every dictionary but has no stored pair.

# Leaf payloads

| Type                  | Payload                                         |
| --                    | --                                              |
| `bool`, `i8`, `u8`    | 1 byte                                          |
| `i16`, `u16`          | 2 bytes                                         |
| `i32`, `u32`, `f32`   | 4 bytes                                         |
| `i64`, `u64`, `f64`   | 8 bytes                                         |
| `char`                | Unicode scalar value as a `u32`                 |
| `String`              | UTF-8 bytes followed by a single zero byte      |
| Byte buffers          | The bytes themselves                            |
| `Vec2`, `Vec3`        | One `f32` leaf per axis, tagged `<tag>_x` etc.  |
| Enumerations          | The discriminant as an `i32`                    |

# Objects

An object is a parent node holding its fields. An absent object is stored as a leaf with an empty
payload. A polymorphic object stores its type id as an `i32` leaf tagged `_TypeID`, written
before its other fields.

# Lists

A list is a parent node holding an `i32` leaf tagged `_ElemCount`, followed by one node tagged
`_Elem` per element. Elements are whatever their type would be on its own: leaves, objects, or
absent objects.

Values stored through serde follow the same rules. Maps are lists of alternating `_Key` and
`_Value` nodes, and enum variants carrying data are parents holding a `_Variant` text leaf and a
`_Value` node.

*/
