use std::{
    cell::{Ref, RefCell, RefMut},
    fmt,
    rc::Rc,
    sync::atomic::{AtomicUsize, Ordering},
};

use log::debug;
use ndarray::{ArrayD, IxDyn};

use crate::{NetErr, Result};

/// A blob shared between the network registry and the layers wired to it.
pub type BlobRef = Rc<RefCell<Blob>>;

type Storage = Rc<RefCell<Vec<f32>>>;

static NEXT_BLOB_ID: AtomicUsize = AtomicUsize::new(0);

/// Identifies a blob for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobId(usize);

impl BlobId {
    fn next() -> Self {
        Self(NEXT_BLOB_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The alias record of a blob: for each of its two arrays, the blob that owns the storage it
/// currently points at, or `None` when the blob owns that array itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Alias {
    pub data: Option<BlobId>,
    pub diff: Option<BlobId>,
}

/// A tensor buffer: two parallel arrays of equal shape, the value (`data`) and the gradient
/// (`diff`).
///
/// Either array may alias another blob's storage, in which case writes through this blob are
/// visible through every blob sharing that storage. Storage is reference counted, so an aliasing
/// blob never frees memory still reachable through its owner.
pub struct Blob {
    id: BlobId,
    name: String,
    shape: Vec<usize>,
    data: Storage,
    diff: Storage,
    alias: Alias,
}

impl Blob {
    /// Creates a new, empty `Blob`.
    ///
    /// # Arguments
    /// * `name` - The name the blob is registered under, used in logs and errors.
    ///
    /// # Returns
    /// A new `Blob` instance with shape `[0]`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_shape(name, &[0])
    }

    /// Creates a new zero filled `Blob` of the given shape.
    ///
    /// # Arguments
    /// * `name` - The name of the blob.
    /// * `shape` - The axes of the blob.
    ///
    /// # Returns
    /// A new `Blob` instance.
    pub fn with_shape(name: impl Into<String>, shape: &[usize]) -> Self {
        let count = shape.iter().product();

        Self {
            id: BlobId::next(),
            name: name.into(),
            shape: shape.to_vec(),
            data: Rc::new(RefCell::new(vec![0.0; count])),
            diff: Rc::new(RefCell::new(vec![0.0; count])),
            alias: Alias::default(),
        }
    }

    /// Wraps this blob so it can be shared between the network and its layers.
    pub fn into_ref(self) -> BlobRef {
        Rc::new(RefCell::new(self))
    }

    pub fn id(&self) -> BlobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn num_axes(&self) -> usize {
        self.shape.len()
    }

    /// Returns the size of the given axis.
    ///
    /// # Panics
    /// If `axis` is out of range, callers validate axes at setup time.
    pub fn dim(&self, axis: usize) -> usize {
        self.shape[axis]
    }

    /// The number of elements held by each of the two arrays.
    pub fn count(&self) -> usize {
        self.shape.iter().product()
    }

    /// The number of elements spanned by the axes in `start..end`.
    pub fn count_range(&self, start: usize, end: usize) -> usize {
        self.shape[start..end].iter().product()
    }

    /// Resolves a possibly negative axis index against this blob's axes.
    ///
    /// # Returns
    /// The canonical axis or `None` if it is out of range.
    pub fn canonical_axis(&self, axis: isize) -> Option<usize> {
        let num_axes = self.num_axes() as isize;
        let axis = if axis < 0 { axis + num_axes } else { axis };
        (0..num_axes).contains(&axis).then_some(axis as usize)
    }

    pub fn alias(&self) -> Alias {
        self.alias
    }

    pub fn is_data_aliased(&self) -> bool {
        self.alias.data.is_some()
    }

    pub fn is_diff_aliased(&self) -> bool {
        self.alias.diff.is_some()
    }

    /// Changes the shape of the blob.
    ///
    /// When the element count changes both arrays get fresh zeroed storage, dropping any alias
    /// and preserving no data. Otherwise only the shape metadata changes.
    ///
    /// # Arguments
    /// * `shape` - The new axes.
    pub fn reshape(&mut self, shape: &[usize]) {
        let count: usize = shape.iter().product();

        if count != self.count() {
            if self.alias != Alias::default() {
                debug!(blob = self.name.as_str(); "reallocation detaches aliased storage");
            }

            self.data = Rc::new(RefCell::new(vec![0.0; count]));
            self.diff = Rc::new(RefCell::new(vec![0.0; count]));
            self.alias = Alias::default();
        }

        self.shape.clear();
        self.shape.extend_from_slice(shape);
    }

    /// Adopts the shape of another blob.
    pub fn reshape_like(&mut self, other: &Blob) {
        self.reshape(&other.shape);
    }

    /// Makes this blob's value array an alias of `other`'s value array.
    ///
    /// # Arguments
    /// * `other` - The blob whose storage is adopted.
    ///
    /// # Returns
    /// An error if the element counts differ or if `other` already aliases this blob.
    pub fn share_data(&mut self, other: &Blob) -> Result<()> {
        let owner = other.alias.data.unwrap_or(other.id);
        self.check_share("data", other, owner)?;

        self.data = Rc::clone(&other.data);
        self.alias.data = Some(owner);
        Ok(())
    }

    /// Makes this blob's gradient array an alias of `other`'s gradient array.
    ///
    /// # Arguments
    /// * `other` - The blob whose storage is adopted.
    ///
    /// # Returns
    /// An error if the element counts differ or if `other` already aliases this blob.
    pub fn share_diff(&mut self, other: &Blob) -> Result<()> {
        let owner = other.alias.diff.unwrap_or(other.id);
        self.check_share("diff", other, owner)?;

        self.diff = Rc::clone(&other.diff);
        self.alias.diff = Some(owner);
        Ok(())
    }

    fn check_share(&self, array: &str, other: &Blob, owner: BlobId) -> Result<()> {
        if owner == self.id {
            return Err(NetErr::invariant(
                &self.name,
                format!("sharing {array} from {} would create an alias cycle", other.name),
            ));
        }

        if other.count() != self.count() {
            return Err(NetErr::CountMismatch {
                what: format!("{array} of {} shared from {}", self.name, other.name),
                got: other.count(),
                expected: self.count(),
            });
        }

        Ok(())
    }

    /// Whether both blobs point at the same value storage.
    pub fn shares_data_with(&self, other: &Blob) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }

    /// Whether both blobs point at the same gradient storage.
    pub fn shares_diff_with(&self, other: &Blob) -> bool {
        Rc::ptr_eq(&self.diff, &other.diff)
    }

    pub fn data(&self) -> Ref<'_, [f32]> {
        Ref::map(self.data.borrow(), |data| data.as_slice())
    }

    pub fn data_mut(&self) -> RefMut<'_, [f32]> {
        RefMut::map(self.data.borrow_mut(), |data| data.as_mut_slice())
    }

    pub fn diff(&self) -> Ref<'_, [f32]> {
        Ref::map(self.diff.borrow(), |diff| diff.as_slice())
    }

    pub fn diff_mut(&self) -> RefMut<'_, [f32]> {
        RefMut::map(self.diff.borrow_mut(), |diff| diff.as_mut_slice())
    }

    /// Fills the value array with `value`.
    pub fn set_data(&self, value: f32) {
        self.data_mut().fill(value);
    }

    /// Fills the gradient array with `value`.
    pub fn set_diff(&self, value: f32) {
        self.diff_mut().fill(value);
    }

    /// Copies the value array from a host slice.
    ///
    /// # Arguments
    /// * `values` - Exactly `count()` values.
    pub fn copy_data_from_slice(&self, values: &[f32]) -> Result<()> {
        if values.len() != self.count() {
            return Err(NetErr::CountMismatch {
                what: format!("data copied into {}", self.name),
                got: values.len(),
                expected: self.count(),
            });
        }

        self.data_mut().copy_from_slice(values);
        Ok(())
    }

    /// Copies the value (or gradient) array of another blob into this one.
    ///
    /// # Arguments
    /// * `other` - The source blob, it must have the same count.
    /// * `diff` - Whether to copy the gradient array instead of the value array.
    pub fn copy_from(&self, other: &Blob, diff: bool) -> Result<()> {
        if other.count() != self.count() {
            return Err(NetErr::CountMismatch {
                what: format!("copy from {} into {}", other.name, self.name),
                got: other.count(),
                expected: self.count(),
            });
        }

        if diff {
            if !self.shares_diff_with(other) {
                self.diff_mut().copy_from_slice(&other.diff());
            }
        } else if !self.shares_data_with(other) {
            self.data_mut().copy_from_slice(&other.data());
        }

        Ok(())
    }

    /// Returns an owned n-dimensional copy of the value array.
    pub fn data_array(&self) -> Result<ArrayD<f32>> {
        Ok(ArrayD::from_shape_vec(IxDyn(&self.shape), self.data().to_vec())?)
    }

    /// Returns an owned n-dimensional copy of the gradient array.
    pub fn diff_array(&self) -> Result<ArrayD<f32>> {
        Ok(ArrayD::from_shape_vec(IxDyn(&self.shape), self.diff().to_vec())?)
    }

    /// A short human readable description of the shape, e.g. `4 2 3 (24)`.
    pub fn shape_string(&self) -> String {
        let dims: Vec<String> = self.shape.iter().map(|d| d.to_string()).collect();
        format!("{} ({})", dims.join(" "), self.count())
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("alias", &self.alias)
            .finish()
    }
}
