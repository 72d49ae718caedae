/// Writes `Self` into a byte buffer.
pub trait Serialize<'a> {
    /// Serializes the header part of `self` into `buf`.
    ///
    /// # Arguments
    /// * `buf` - The buffer to extend with the serialized header.
    ///
    /// # Returns
    /// An optional borrowed tail that is written right after `buf` without copying.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}
