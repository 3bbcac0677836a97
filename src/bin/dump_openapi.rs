use std::fs;

fn main() -> anyhow::Result<()> {
    let doc = parcelhub::docs::build_openapi(8000)?;
    let json = serde_json::to_string_pretty(&doc)?;
    let path = "/tmp/parcelhub-openapi.json";
    fs::write(path, json)?;
    println!("wrote {}", path);
    Ok(())
}
