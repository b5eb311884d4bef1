/// Types implementing `WireSerialisable` can be written to a control
/// connection as a complete, CRLF-terminated response.
pub trait WireSerialisable {
    /// Renders the value as the bytes sent to the client.
    fn serialise_wire(&self) -> Vec<u8>;
}
