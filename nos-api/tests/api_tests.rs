//! API tests

use std::sync::Arc;

use nos_api::error::{Error, ErrorClass, MmapRejection};
use nos_api::{FileHandle, MAP_FAILED, STDIN_FILENO, STDOUT_FILENO};

struct Empty;

impl FileHandle for Empty {
    fn read_at(&self, _buf: &mut [u8], _offset: usize) -> usize {
        0
    }

    fn write_at(&self, _buf: &[u8], _offset: usize) -> usize {
        0
    }

    fn length(&self) -> usize {
        0
    }

    fn reopen(&self) -> Option<Arc<dyn FileHandle>> {
        Some(Arc::new(Empty))
    }
}

#[test]
fn test_error_display() {
    assert_eq!(Error::IllegalAccess(0x1000).to_string(), "Illegal access at 0x1000");
    assert_eq!(
        Error::MappingRejected(MmapRejection::EmptyFile).to_string(),
        "Mapping rejected: file is empty"
    );
    assert_eq!(
        Error::ShortRead { expected: 4096, actual: 12 }.to_string(),
        "Short read: expected 4096 bytes, got 12"
    );
}

#[test]
fn test_error_class() {
    assert_eq!(Error::OutOfMemory.class(), ErrorClass::Fatal);
    assert_eq!(Error::WriteToReadOnly(0x2000).class(), ErrorClass::ProcessTerminating);
}

#[test]
fn test_reserved_descriptors() {
    assert_eq!(STDIN_FILENO, 0);
    assert_eq!(STDOUT_FILENO, 1);
    assert_eq!(MAP_FAILED, -1);
}

#[test]
fn test_file_handle_is_object_safe() {
    let file: Arc<dyn FileHandle> = Arc::new(Empty);
    let reopened = file.reopen().expect("reopen");
    assert_eq!(reopened.length(), 0);
}
