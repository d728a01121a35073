use crate::analysis::trace::ExecutionTrace;
use crate::store::{CallKey, Registry};
use std::fmt::Write;

/// Renders a trace as its call forest, one root per controller call.
///
/// Reads answered from the cache appear as `(cached)` leaves; reads that ran a
/// body are expanded in place.
pub fn format_call_tree<D>(registry: &Registry<D>, trace: &ExecutionTrace) -> String {
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); trace.len()];
    for event in trace.events() {
        if let Some(caller) = event.caller {
            if let Some(list) = children.get_mut(caller) {
                list.push(event.order);
            }
        }
    }

    let mut tracer = Tracer { registry, trace, children, output: String::new() };
    let _ = writeln!(tracer.output, "CALL TREE ({} calls, {} reads):", trace.len(), trace.edges().len());
    let _ = writeln!(tracer.output, "--------------------------------------------------");
    for root in trace.roots() {
        tracer.trace_call(root.order, "", "");
    }
    tracer.output
}

struct Tracer<'a, D> {
    registry: &'a Registry<D>,
    trace: &'a ExecutionTrace,
    // event order -> orders of the calls it ran, in start order
    children: Vec<Vec<usize>>,
    output: String,
}

impl<'a, D> Tracer<'a, D> {
    fn trace_call(&mut self, order: usize, prefix: &str, stem: &str) {
        let (registry, trace) = (self.registry, self.trace);
        let Some(event) = trace.event(order) else { return };

        let done = event.completion.map(|c| c.to_string()).unwrap_or_else(|| "open".into());
        let _ = writeln!(self.output, "{}[L{}] {} (#{}, done {})", prefix, event.depth, registry.label(event.key), order, done);

        let reads: Vec<CallKey> = trace.reads_of(order).map(|e| e.callee).collect();
        let mut pending = self.children.get(order).cloned().unwrap_or_default().into_iter().peekable();

        for (i, &callee) in reads.iter().enumerate() {
            let is_last = i + 1 == reads.len();
            let connector = if is_last { "`-- " } else { "|-- " };
            let line_prefix = format!("{}{}", stem, connector);
            let child_stem = format!("{}{}", stem, if is_last { "    " } else { "|   " });

            match pending.peek().and_then(|&c| trace.event(c)) {
                // A miss: the next nested call is the one this read started.
                Some(child) if child.key == callee => {
                    let child_order = child.order;
                    pending.next();
                    self.trace_call(child_order, &line_prefix, &child_stem);
                }
                _ => {
                    let _ = writeln!(self.output, "{}{} (cached)", line_prefix, registry.label(callee));
                }
            }
        }
    }
}
