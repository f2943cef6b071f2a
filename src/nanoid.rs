/// Short random id used for connection tags and temp file names.
pub fn nanoid() -> String {
    ::nanoid::nanoid!(12)
}
