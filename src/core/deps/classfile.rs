use std::collections::BTreeSet;

use crate::core::error::{UpdaterError, UpdaterResult};

// Constant pool tags, per the published class file format.
const CONSTANT_UTF8: u8 = 1;
const CONSTANT_INTEGER: u8 = 3;
const CONSTANT_FLOAT: u8 = 4;
const CONSTANT_LONG: u8 = 5;
const CONSTANT_DOUBLE: u8 = 6;
const CONSTANT_CLASS: u8 = 7;
const CONSTANT_STRING: u8 = 8;
const CONSTANT_FIELDREF: u8 = 9;
const CONSTANT_METHODREF: u8 = 10;
const CONSTANT_INTERFACE_METHODREF: u8 = 11;
const CONSTANT_NAME_AND_TYPE: u8 = 12;
const CONSTANT_METHOD_HANDLE: u8 = 15;
const CONSTANT_METHOD_TYPE: u8 = 16;
const CONSTANT_DYNAMIC: u8 = 17;
const CONSTANT_INVOKE_DYNAMIC: u8 = 18;
const CONSTANT_MODULE: u8 = 19;
const CONSTANT_PACKAGE: u8 = 20;

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> UpdaterResult<u8> {
        let value = *self
            .bytes
            .get(self.offset)
            .ok_or_else(|| truncated(self.offset))?;
        self.offset += 1;
        Ok(value)
    }

    fn u16(&mut self) -> UpdaterResult<u16> {
        let hi = self.u8()? as u16;
        let lo = self.u8()? as u16;
        Ok((hi << 8) | lo)
    }

    fn u32(&mut self) -> UpdaterResult<u32> {
        let hi = self.u16()? as u32;
        let lo = self.u16()? as u32;
        Ok((hi << 16) | lo)
    }

    fn slice(&mut self, length: usize) -> UpdaterResult<&'a [u8]> {
        let end = self.offset + length;
        let slice = self
            .bytes
            .get(self.offset..end)
            .ok_or_else(|| truncated(self.offset))?;
        self.offset = end;
        Ok(slice)
    }
}

fn truncated(offset: usize) -> UpdaterError {
    UpdaterError::Other(format!("truncated class file at offset {offset}"))
}

/// Class names referenced from a compiled unit's constant pool, in dotted
/// form. Array descriptors are unwrapped to their element class; primitive
/// arrays are skipped.
pub fn referenced_classes(code: &[u8]) -> UpdaterResult<BTreeSet<String>> {
    let mut cursor = Cursor {
        bytes: code,
        offset: 0,
    };
    if cursor.u32()? != 0xCAFE_BABE {
        return Err(UpdaterError::Other("not a class file".to_string()));
    }
    cursor.u16()?; // minor version
    cursor.u16()?; // major version

    let pool_count = cursor.u16()? as usize;
    let mut utf8: Vec<Option<String>> = vec![None; pool_count];
    let mut class_name_indexes: Vec<usize> = Vec::new();

    let mut index = 1;
    while index < pool_count {
        let tag = cursor.u8()?;
        match tag {
            CONSTANT_UTF8 => {
                let length = cursor.u16()? as usize;
                let bytes = cursor.slice(length)?;
                utf8[index] = Some(String::from_utf8_lossy(bytes).to_string());
            }
            CONSTANT_INTEGER | CONSTANT_FLOAT => {
                cursor.slice(4)?;
            }
            CONSTANT_LONG | CONSTANT_DOUBLE => {
                cursor.slice(8)?;
                index += 1; // these take two pool slots
            }
            CONSTANT_CLASS => {
                class_name_indexes.push(cursor.u16()? as usize);
            }
            CONSTANT_STRING | CONSTANT_METHOD_TYPE | CONSTANT_MODULE | CONSTANT_PACKAGE => {
                cursor.slice(2)?;
            }
            CONSTANT_FIELDREF
            | CONSTANT_METHODREF
            | CONSTANT_INTERFACE_METHODREF
            | CONSTANT_NAME_AND_TYPE
            | CONSTANT_DYNAMIC
            | CONSTANT_INVOKE_DYNAMIC => {
                cursor.slice(4)?;
            }
            CONSTANT_METHOD_HANDLE => {
                cursor.slice(3)?;
            }
            other => {
                return Err(UpdaterError::Other(format!(
                    "unknown constant pool tag {other}"
                )))
            }
        }
        index += 1;
    }

    let mut result = BTreeSet::new();
    for name_index in class_name_indexes {
        let Some(Some(name)) = utf8.get(name_index) else {
            continue;
        };
        if let Some(class_name) = descriptor_to_class_name(name) {
            result.insert(class_name);
        }
    }
    Ok(result)
}

fn descriptor_to_class_name(name: &str) -> Option<String> {
    let mut name = name;
    // Array classes appear as descriptors: [[Lorg/example/Foo;
    while let Some(rest) = name.strip_prefix('[') {
        name = rest;
    }
    if let Some(rest) = name.strip_prefix('L') {
        name = rest.strip_suffix(';')?;
    } else if name.len() == 1 {
        return None; // primitive array element
    }
    Some(name.replace('/', "."))
}
