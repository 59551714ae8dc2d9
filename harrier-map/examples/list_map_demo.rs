//! Sorted-list map walkthrough: inserts, lookups, replacement, removal,
//! with a traversal dump after each phase.

use harrier::HazardContext;
use harrier_map::ListMap;

fn show(map: &ListMap<i32, String>) {
    map.for_each(|key, value| print!("{key}:{value}, "));
    println!();
}

fn main() {
    let _ctx = HazardContext::enter();
    let map = ListMap::new();

    map.put(7, "foo".to_string());
    map.put(3, "bar".to_string());
    map.put(5, "baz".to_string());

    show(&map);

    let out = map.get(&5);
    println!("{}:{}", out.is_some(), out.unwrap_or_default());
    let out = map.get(&6);
    println!("{}:{}", out.is_some(), out.unwrap_or_default());

    show(&map);

    let out = map.put(3, "hoge".to_string());
    println!("{}:{}", out.is_some(), out.unwrap_or_default());
    let out = map.put(4, "fuga".to_string());
    println!("{}:{}", out.is_some(), out.unwrap_or_default());

    show(&map);

    let out = map.remove(&5);
    println!("{}:{}", out.is_some(), out.unwrap_or_default());
    let out = map.remove(&6);
    println!("{}:{}", out.is_some(), out.unwrap_or_default());

    show(&map);
}
