//! Shared regions laid out for NumPy consumers.
//!
//! The region starts with a little-endian metadata prefix of
//! `u32 rank; u32 dim[rank]; byte[16] dtype tag; byte endian`, and the
//! data follows immediately, so the Python side can reconstruct an array
//! header without extra channel traffic.

use std::marker::PhantomData;

use crate::shm::SharedMemory;
use crate::{Error, Result};

/// Width of the zero-padded ASCII dtype tag.
pub const DTYPE_TAG_LEN: usize = 16;

const ENDIAN_LITTLE: u8 = b'L';

/// An element type with a NumPy dtype name.
pub trait Element: Copy + 'static {
    /// ASCII dtype tag, e.g. `"float32"`.
    const DTYPE: &'static str;
}

macro_rules! impl_element {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(impl Element for $ty {
            const DTYPE: &'static str = $name;
        })*
    };
}

impl_element! {
    f32 => "float32",
    f64 => "float64",
    i8 => "int8",
    i16 => "int16",
    i32 => "int32",
    i64 => "int64",
    u8 => "uint8",
    u16 => "uint16",
    u32 => "uint32",
    u64 => "uint64",
    bool => "bool",
}

/// Size in bytes of a dtype by tag name, covering the complex types the
/// header format admits but Rust has no primitive for.
pub fn dtype_size(dtype: &str) -> Option<usize> {
    match dtype {
        "int8" | "uint8" | "bool" => Some(1),
        "int16" | "uint16" => Some(2),
        "float32" | "int32" | "uint32" => Some(4),
        "float64" | "int64" | "uint64" | "complex64" => Some(8),
        "complex128" => Some(16),
        _ => None,
    }
}

/// Byte length of the metadata prefix for a given rank.
pub fn header_len(rank: usize) -> usize {
    4 + rank * 4 + DTYPE_TAG_LEN + 1
}

/// A shared region carrying one typed, shaped array.
///
/// Element accessors use unaligned loads and stores: the data region
/// starts right after the prefix, whose length is not a multiple of the
/// element size in general.
#[derive(Debug)]
pub struct SharedArray<T: Element> {
    shm: SharedMemory,
    shape: Vec<usize>,
    _marker: PhantomData<T>,
}

impl<T: Element> SharedArray<T> {
    /// Create a shared array region and write its metadata prefix.
    pub fn create(name: &str, shape: &[usize]) -> Result<Self> {
        let count: usize = shape.iter().product();
        let total = header_len(shape.len()) + count * std::mem::size_of::<T>();
        let shm = SharedMemory::create(name, total)?;

        let mut header = Vec::with_capacity(header_len(shape.len()));
        header.extend_from_slice(&(shape.len() as u32).to_le_bytes());
        for &dim in shape {
            header.extend_from_slice(&(dim as u32).to_le_bytes());
        }
        let mut tag = [0u8; DTYPE_TAG_LEN];
        tag[..T::DTYPE.len()].copy_from_slice(T::DTYPE.as_bytes());
        header.extend_from_slice(&tag);
        header.push(ENDIAN_LITTLE);
        shm.write_at(&header, 0)?;

        Ok(Self {
            shm,
            shape: shape.to_vec(),
            _marker: PhantomData,
        })
    }

    /// Open an existing shared array and validate its prefix against the
    /// expected shape and element type.
    pub fn open(name: &str, shape: &[usize]) -> Result<Self> {
        let count: usize = shape.iter().product();
        let total = header_len(shape.len()) + count * std::mem::size_of::<T>();
        let shm = SharedMemory::open(name, total)?;

        let mut header = vec![0u8; header_len(shape.len())];
        shm.read_at(&mut header, 0)?;
        let rank = u32::from_le_bytes(header[..4].try_into().unwrap()) as usize;
        if rank != shape.len() {
            return Err(Error::SharedMemory(format!(
                "region {name:?} has rank {rank}, expected {}",
                shape.len()
            )));
        }
        for (i, &dim) in shape.iter().enumerate() {
            let stored =
                u32::from_le_bytes(header[4 + i * 4..8 + i * 4].try_into().unwrap()) as usize;
            if stored != dim {
                return Err(Error::SharedMemory(format!(
                    "region {name:?} dimension {i} is {stored}, expected {dim}"
                )));
            }
        }
        let tag_start = 4 + rank * 4;
        let tag = &header[tag_start..tag_start + DTYPE_TAG_LEN];
        let stored_dtype = std::str::from_utf8(tag)
            .unwrap_or_default()
            .trim_end_matches('\0');
        if stored_dtype != T::DTYPE {
            return Err(Error::SharedMemory(format!(
                "region {name:?} holds dtype {stored_dtype:?}, expected {:?}",
                T::DTYPE
            )));
        }

        Ok(Self {
            shm,
            shape: shape.to_vec(),
            _marker: PhantomData,
        })
    }

    /// Array shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Whether the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte offset where the data region starts.
    pub fn data_offset(&self) -> usize {
        header_len(self.shape.len())
    }

    /// Read the element at flat index `index`.
    pub fn get(&self, index: usize) -> T {
        assert!(index < self.len(), "index {index} out of bounds");
        let offset = self.data_offset() + index * std::mem::size_of::<T>();
        // SAFETY: the offset is within the mapping; the load is unaligned
        // by contract.
        unsafe { self.shm.as_ptr().add(offset).cast::<T>().read_unaligned() }
    }

    /// Write the element at flat index `index`.
    pub fn set(&self, index: usize, value: T) {
        assert!(index < self.len(), "index {index} out of bounds");
        let offset = self.data_offset() + index * std::mem::size_of::<T>();
        // SAFETY: the offset is within the mapping; the store is unaligned
        // by contract.
        unsafe {
            self.shm
                .as_ptr()
                .add(offset)
                .cast::<T>()
                .write_unaligned(value);
        }
    }

    /// Fill the data region from a slice of exactly `len()` elements.
    pub fn copy_from_slice(&self, src: &[T]) -> Result<()> {
        if src.len() != self.len() {
            return Err(Error::SharedMemory(format!(
                "source has {} elements, array holds {}",
                src.len(),
                self.len()
            )));
        }
        let bytes = std::mem::size_of_val(src);
        // SAFETY: the destination range lies within the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr().cast::<u8>(),
                self.shm.as_ptr().add(self.data_offset()),
                bytes,
            );
        }
        Ok(())
    }

    /// Copy the data region out into a vector.
    pub fn to_vec(&self) -> Vec<T> {
        let count = self.len();
        let mut out: Vec<T> = Vec::with_capacity(count);
        let bytes = count * std::mem::size_of::<T>();
        // SAFETY: the source range lies within the mapping and the
        // destination has `count` elements of capacity.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.shm.as_ptr().add(self.data_offset()),
                out.as_mut_ptr().cast::<u8>(),
                bytes,
            );
            out.set_len(count);
        }
        out
    }

    /// The underlying region.
    pub fn shm(&self) -> &SharedMemory {
        &self.shm
    }
}
