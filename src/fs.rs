use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

pub fn read_file_as_bytes(path: impl AsRef<Path>) -> io::Result<Vec<u8>> {
    fs::read(path)
}

/// Write `data` to `path` and clamp the file mode. Used for private key
/// material, which must only be readable by the owner.
pub fn write_with_mode(path: impl AsRef<Path>, data: &[u8], mode: u32) -> io::Result<()> {
    let path = path.as_ref();
    fs::write(path, data)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}
