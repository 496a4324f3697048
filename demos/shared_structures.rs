//! Record shapes shared across sessions through a structure store.
//!
//! Run with: cargo run --example shared_structures

use serde_packr::{
    packr, InMemoryStructures, Options, Packer, SharedValue, StructureStore, Unpacker, Value,
};
use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    let store = InMemoryStructures::new();
    let event = |id: i64, kind: &str| packr!({ "id": id, "kind": kind, "ok": true });

    // The first session defines the shape inline and saves it.
    let first = Packer::new()
        .with_structure_store(store.clone())
        .encode(&event(1, "login"))?;
    println!("first message:  {} bytes {:02x?}", first.len(), first);

    // A later session only writes the record id.
    let second = Packer::new()
        .with_structure_store(store.clone())
        .encode(&event(2, "logout"))?;
    println!("second message: {} bytes {:02x?}", second.len(), second);
    println!("stored shapes:  {:?}\n", store.get_structures());

    let mut unpacker = Unpacker::new().with_structure_store(store);
    println!("decoded: {:?}", unpacker.decode(&second)?);

    // Structured clone keeps identity and cycles.
    let node = SharedValue::new(packr!({ "name": "root" }));
    let graph = Value::from(vec![Value::Shared(node.clone()), Value::Shared(node.clone())]);
    let options = Options::new().with_structured_clone(true);
    let bytes = Packer::with_options(options.clone()).encode(&graph)?;
    let back = Unpacker::with_options(options).decode(&bytes)?;
    if let Some(items) = back.as_array() {
        if let (Some(a), Some(b)) = (items[0].as_shared(), items[1].as_shared()) {
            println!("same node after decode: {}", a.ptr_eq(b));
        }
    }

    Ok(())
}
