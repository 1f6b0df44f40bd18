/// Display version information
pub fn execute() {
    println!("subgate {}", env!("CARGO_PKG_VERSION"));
    println!("Operator CLI for the subscription verification gate");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_execute() {
        execute();
    }
}
