/// Format a float the way clients expect it on the wire: integers without a
/// trailing fraction, infinities as `inf`/`-inf`, everything else in the
/// shortest round-trippable decimal form.
pub fn fmt_f64(value: f64) -> String {
    if value.is_infinite() {
        return if value > 0.0 { "inf".into() } else { "-inf".into() };
    }
    // `{}` on f64 already produces the shortest representation that parses
    // back exactly, and renders whole values without a fraction.
    format!("{value}")
}
