//! Materializes a placement command stream into the final text section.
//!
//! The command stream is the external interface between the layout engine
//! and whatever container format ultimately writes the bytes to disk. The
//! writer preserves the pre-computed absolute offsets exactly and rejects
//! streams that could not have come from a correct layout run.

use opal_core::callsite::CodeId;
use thiserror::Error;

use crate::layout::ImageCommand;
use crate::object::CodeObject;

// =============================================================================
// Errors
// =============================================================================

/// A malformed placement command stream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    /// Commands must arrive in ascending offset order.
    #[error("command at offset {offset} arrives after the stream reached {end}")]
    OutOfOrder {
        /// Offset of the offending command.
        offset: u64,
        /// End of the bytes written so far.
        end: u64,
    },
    /// A command names a code object the writer was not given.
    #[error("command references unknown code object {0}")]
    UnknownObject(u32),
}

// =============================================================================
// Image Writer
// =============================================================================

/// Concatenates placement commands into one text-section buffer.
#[derive(Debug, Default)]
pub struct ImageWriter;

impl ImageWriter {
    /// Produce the text-section bytes for `commands`.
    ///
    /// Offsets are honored exactly; a gap between consecutive items is
    /// zero-filled padding. Overlapping or descending offsets are rejected.
    pub fn write(
        commands: &[ImageCommand],
        objects: &[CodeObject],
    ) -> Result<Vec<u8>, ImageError> {
        let mut section = Vec::new();

        for command in commands {
            let offset = command.offset();
            let end = section.len() as u64;
            if offset < end {
                return Err(ImageError::OutOfOrder { offset, end });
            }
            section.resize(offset as usize, 0);

            match command {
                ImageCommand::PlaceObject { id, .. } => {
                    let object = objects
                        .get(id.index())
                        .ok_or(ImageError::UnknownObject(id.index() as u32))?;
                    section.extend_from_slice(object.payload());
                }
                ImageCommand::PlaceTrampoline { bytes, .. } => {
                    section.extend_from_slice(bytes);
                }
            }
        }

        Ok(section)
    }

    /// Convenience accessor: the payload slice a placed object occupies in
    /// `section`.
    pub fn placed_slice<'s>(
        section: &'s [u8],
        commands: &[ImageCommand],
        id: CodeId,
    ) -> Option<&'s [u8]> {
        commands.iter().find_map(|command| match command {
            ImageCommand::PlaceObject {
                id: placed,
                offset,
            } if *placed == id => {
                let start = *offset as usize;
                section.get(start..)
            }
            _ => None,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_concatenates_in_order() {
        let objects = vec![
            CodeObject::new(vec![0xAA; 4]),
            CodeObject::new(vec![0xBB; 2]),
        ];
        let commands = vec![
            ImageCommand::PlaceObject {
                id: CodeId::new(0),
                offset: 0,
            },
            ImageCommand::PlaceTrampoline {
                bytes: vec![0xEE; 2].into_boxed_slice(),
                offset: 4,
            },
            ImageCommand::PlaceObject {
                id: CodeId::new(1),
                offset: 6,
            },
        ];

        let section = ImageWriter::write(&commands, &objects).unwrap();
        assert_eq!(section, vec![0xAA, 0xAA, 0xAA, 0xAA, 0xEE, 0xEE, 0xBB, 0xBB]);
    }

    #[test]
    fn test_write_zero_fills_gaps() {
        let objects = vec![CodeObject::new(vec![0xAA; 2])];
        let commands = vec![ImageCommand::PlaceObject {
            id: CodeId::new(0),
            offset: 4,
        }];

        let section = ImageWriter::write(&commands, &objects).unwrap();
        assert_eq!(section, vec![0, 0, 0, 0, 0xAA, 0xAA]);
    }

    #[test]
    fn test_write_rejects_overlap() {
        let objects = vec![
            CodeObject::new(vec![0xAA; 8]),
            CodeObject::new(vec![0xBB; 4]),
        ];
        let commands = vec![
            ImageCommand::PlaceObject {
                id: CodeId::new(0),
                offset: 0,
            },
            ImageCommand::PlaceObject {
                id: CodeId::new(1),
                offset: 4,
            },
        ];

        let error = ImageWriter::write(&commands, &objects).unwrap_err();
        assert_eq!(error, ImageError::OutOfOrder { offset: 4, end: 8 });
    }

    #[test]
    fn test_write_rejects_unknown_object() {
        let commands = vec![ImageCommand::PlaceObject {
            id: CodeId::new(3),
            offset: 0,
        }];

        let error = ImageWriter::write(&commands, &[]).unwrap_err();
        assert_eq!(error, ImageError::UnknownObject(3));
    }
}
