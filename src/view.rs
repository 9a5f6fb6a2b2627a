//! Non-owning strided views over caller buffers.
//!
//! Views borrow the caller's storage for the duration of one call and never
//! own it. Shapes are column-major by default (first dimension fastest), so a
//! `(layer, batch, time)` activation tensor stores one timestep's
//! `layer × batch` matrix contiguously.

use std::marker::PhantomData;

use crate::{
    error::{RecurrentError, Result},
    precision::{Element, Precision},
};

/// Shape and strides (in elements) of a view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    shape: Vec<usize>,
    strides: Vec<usize>,
}

impl Layout {
    /// Column-major contiguous layout.
    pub fn contiguous(shape: &[usize]) -> Self {
        let mut strides = Vec::with_capacity(shape.len());
        let mut stride = 1;
        for &dim in shape {
            strides.push(stride);
            stride *= dim;
        }
        Self {
            shape: shape.to_vec(),
            strides,
        }
    }

    pub fn strided(shape: &[usize], strides: &[usize]) -> Result<Self> {
        if shape.len() != strides.len() {
            return Err(RecurrentError::InvalidView(format!(
                "rank mismatch: shape {shape:?} vs strides {strides:?}"
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            strides: strides.to_vec(),
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of addressed elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One past the largest addressed offset.
    pub fn span(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        1 + self
            .shape
            .iter()
            .zip(&self.strides)
            .map(|(&dim, &stride)| (dim - 1) * stride)
            .sum::<usize>()
    }

    pub fn offset(&self, index: &[usize]) -> usize {
        debug_assert_eq!(index.len(), self.rank());
        index.iter().zip(&self.strides).map(|(i, s)| i * s).sum()
    }

    /// True when no two indices address the same element.
    pub fn is_non_overlapping(&self) -> bool {
        let mut dims: Vec<(usize, usize)> = self
            .shape
            .iter()
            .zip(&self.strides)
            .filter(|(dim, _)| **dim > 1)
            .map(|(&dim, &stride)| (stride, dim))
            .collect();
        dims.sort_unstable();

        let mut required = 1;
        for (stride, dim) in dims {
            if stride < required {
                return false;
            }
            required = stride * dim;
        }
        true
    }

    fn check_fits(&self, available: usize) -> Result<()> {
        let span = self.span();
        if span > available {
            return Err(RecurrentError::InvalidView(format!(
                "layout {:?}/{:?} addresses {span} elements but buffer holds {available}",
                self.shape, self.strides
            )));
        }
        Ok(())
    }
}

/// Read-only view.
#[derive(Clone)]
pub struct TensorView<'a, E> {
    data: &'a [E],
    layout: Layout,
}

impl<'a, E: Element> TensorView<'a, E> {
    pub fn new(data: &'a [E], shape: &[usize]) -> Result<Self> {
        Self::with_layout(data, Layout::contiguous(shape))
    }

    pub fn with_strides(data: &'a [E], shape: &[usize], strides: &[usize]) -> Result<Self> {
        Self::with_layout(data, Layout::strided(shape, strides)?)
    }

    pub fn with_layout(data: &'a [E], layout: Layout) -> Result<Self> {
        layout.check_fits(data.len())?;
        Ok(Self { data, layout })
    }

    pub fn precision(&self) -> Precision {
        E::PRECISION
    }

    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    pub fn strides(&self) -> &[usize] {
        self.layout.strides()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn get(&self, index: &[usize]) -> E {
        self.data[self.layout.offset(index)]
    }

    pub(crate) fn data(&self) -> &'a [E] {
        self.data
    }
}

/// Mutable view.
pub struct TensorViewMut<'a, E> {
    data: &'a mut [E],
    layout: Layout,
}

impl<'a, E: Element> TensorViewMut<'a, E> {
    pub fn new(data: &'a mut [E], shape: &[usize]) -> Result<Self> {
        Self::with_layout(data, Layout::contiguous(shape))
    }

    pub fn with_strides(data: &'a mut [E], shape: &[usize], strides: &[usize]) -> Result<Self> {
        Self::with_layout(data, Layout::strided(shape, strides)?)
    }

    pub fn with_layout(data: &'a mut [E], layout: Layout) -> Result<Self> {
        layout.check_fits(data.len())?;
        if !layout.is_non_overlapping() {
            return Err(RecurrentError::InvalidView(format!(
                "mutable view with overlapping strides {:?} for shape {:?}",
                layout.strides(),
                layout.shape()
            )));
        }
        Ok(Self { data, layout })
    }

    pub fn precision(&self) -> Precision {
        E::PRECISION
    }

    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    pub fn strides(&self) -> &[usize] {
        self.layout.strides()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn as_view(&self) -> TensorView<'_, E> {
        TensorView {
            data: self.data,
            layout: self.layout.clone(),
        }
    }

    pub fn get(&self, index: &[usize]) -> E {
        self.data[self.layout.offset(index)]
    }

    pub fn set(&mut self, index: &[usize], value: E) {
        let offset = self.layout.offset(index);
        self.data[offset] = value;
    }

    /// Split into the shared unit pointer and the layout it is indexed by.
    pub(crate) fn into_shared(self) -> (SharedMut<'a, E>, Layout) {
        (SharedMut::new(self.data), self.layout)
    }
}

/// Engine-private scratch memory.
///
/// The engine alone interprets the layout. Buffers should be at least 8-byte
/// aligned; [`Scratch`](crate::scratch::Scratch) guarantees it.
pub struct ScratchView<'a> {
    bytes: &'a mut [u8],
}

impl<'a> ScratchView<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        self.bytes
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        self.bytes
    }
}

/// Raw pointer to a buffer that cooperating units read and write concurrently.
///
/// Bounds are checked in debug builds. Callers uphold the engine's ownership
/// rule: an element is written by exactly one unit per epoch, and nobody reads
/// it in that epoch unless it is the writer.
pub(crate) struct SharedMut<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

impl<T> Clone for SharedMut<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SharedMut<'_, T> {}

unsafe impl<T: Send> Send for SharedMut<'_, T> {}
unsafe impl<T: Send> Sync for SharedMut<'_, T> {}

impl<'a, T: Copy> SharedMut<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    /// # Safety
    /// No other unit may write `index` during the current epoch.
    #[inline(always)]
    pub unsafe fn read(&self, index: usize) -> T {
        debug_assert!(index < self.len, "read {index} out of {}", self.len);
        unsafe { self.ptr.add(index).read() }
    }

    /// # Safety
    /// The caller must be the only unit touching `index` during the current epoch.
    #[inline(always)]
    pub unsafe fn write(&self, index: usize, value: T) {
        debug_assert!(index < self.len, "write {index} out of {}", self.len);
        unsafe { self.ptr.add(index).write(value) }
    }

    /// # Safety
    /// `start..start + len` must be owned exclusively by the caller for as long
    /// as the returned slice lives.
    pub unsafe fn slice_mut(&self, start: usize, len: usize) -> &'a mut [T] {
        assert!(start + len <= self.len, "slice {start}+{len} out of {}", self.len);
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(start), len) }
    }
}
