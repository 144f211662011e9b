use crate::demo;

pub(crate) fn cmd_services() -> anyhow::Result<()> {
    let factories = demo::factories();
    let mut classes: Vec<&str> = factories.classes().collect();
    classes.sort_unstable();
    if classes.is_empty() {
        println!("No services registered");
        return Ok(());
    }
    for class in classes {
        println!("{class}");
    }
    Ok(())
}
