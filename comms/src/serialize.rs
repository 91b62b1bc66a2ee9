/// Writes a message into a byte buffer.
pub trait Serialize<'a> {
    /// Serializes `self` into `buf`.
    ///
    /// # Arguments
    /// * `buf` - The buffer to append the header and any owned bytes to.
    ///
    /// # Returns
    /// A borrowed byte slice to write right after `buf` without copying it, if any.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}
