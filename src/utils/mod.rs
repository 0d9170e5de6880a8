pub mod sampling;

#[cfg(test)]
pub(crate) mod testing;
