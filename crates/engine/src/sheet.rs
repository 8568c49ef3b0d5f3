//! The spreadsheet cell store and ordered recomputation.
//!
//! `Spreadsheet` owns the sparse cell map and the dependency graph, and keeps
//! them consistent through a single transactional mutator, [`Spreadsheet::set_contents`]:
//! either the whole update (graph rewiring, storage, recomputation of every
//! transitive dependent) succeeds, or nothing changes.

use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;

use crate::cell::{is_cell_name, Cell, CellContents, CellValue};
use crate::dep_graph::DepGraph;

/// Caller-supplied predicate deciding which (normalized) cell names exist.
pub type Validator = Box<dyn Fn(&str) -> bool + Send>;

/// Caller-supplied name canonicalizer, typically uppercasing.
pub type Normalizer = Box<dyn Fn(&str) -> String + Send>;

/// A rejected update that would make a cell depend on itself.
#[derive(Debug, Clone)]
pub struct CycleError {
    /// Cells on the detected cycle path, starting and (implicitly) ending at
    /// the same cell.
    pub cells: Vec<String>,
    pub message: String,
}

impl CycleError {
    pub fn new(cells: Vec<String>) -> CycleError {
        let mut message = format!("circular dependency: {}", cells.join(" → "));
        if let Some(first) = cells.first() {
            message.push_str(" → ");
            message.push_str(first);
        }
        CycleError { cells, message }
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CycleError {}

/// Why an engine call was rejected. These are the synchronous failures;
/// protocol outcomes arrive as events instead.
#[derive(Debug)]
pub enum SheetError {
    /// Name fails the shape check, the validity predicate, or normalization.
    InvalidName(String),
    /// Formula source could not be parsed.
    FormulaFormat(String),
    /// The proposed contents would create a dependency cycle.
    Circular(CycleError),
}

impl fmt::Display for SheetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SheetError::InvalidName(name) => write!(f, "invalid cell name: {}", name),
            SheetError::FormulaFormat(msg) => write!(f, "bad formula: {}", msg),
            SheetError::Circular(cycle) => write!(f, "{}", cycle),
        }
    }
}

impl std::error::Error for SheetError {}

/// Sparse cell store plus dependency graph.
pub struct Spreadsheet {
    cells: FxHashMap<String, Cell>,
    graph: DepGraph,
    is_valid: Validator,
    normalize: Normalizer,
    changed: bool,
}

impl Spreadsheet {
    pub fn new(is_valid: Validator, normalize: Normalizer) -> Spreadsheet {
        Spreadsheet {
            cells: FxHashMap::default(),
            graph: DepGraph::new(),
            is_valid,
            normalize,
            changed: false,
        }
    }

    /// Normalize and validate a cell name.
    pub fn normalize_name(&self, name: &str) -> Result<String, SheetError> {
        if !is_cell_name(name) {
            return Err(SheetError::InvalidName(name.to_string()));
        }
        let normalized = (self.normalize)(name);
        if !is_cell_name(&normalized) || !(self.is_valid)(&normalized) {
            return Err(SheetError::InvalidName(name.to_string()));
        }
        Ok(normalized)
    }

    /// Authored contents of `name`; absent cells read as empty text.
    pub fn contents(&self, name: &str) -> Result<CellContents, SheetError> {
        let name = self.normalize_name(name)?;
        Ok(self
            .cells
            .get(&name)
            .map(|cell| cell.contents.clone())
            .unwrap_or_else(|| CellContents::Text(String::new())))
    }

    /// Computed value of `name`; absent cells read as empty text.
    pub fn value(&self, name: &str) -> Result<CellValue, SheetError> {
        let name = self.normalize_name(name)?;
        Ok(self
            .cells
            .get(&name)
            .map(|cell| cell.value.clone())
            .unwrap_or_else(CellValue::empty))
    }

    /// Names of every stored cell, in no particular order.
    pub fn nonempty_names(&self) -> impl Iterator<Item = &str> {
        self.cells.keys().map(String::as_str)
    }

    /// True once any `set_contents` has taken effect since the last save.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Clear the dirty flag after a successful save.
    pub fn mark_saved(&mut self) {
        self.changed = false;
    }

    /// Validate a proposed update without applying it.
    ///
    /// Runs the same name, format, and cycle checks as [`set_contents`],
    /// restoring the graph before returning. The client calls this before
    /// putting a change on the wire.
    ///
    /// [`set_contents`]: Spreadsheet::set_contents
    pub fn check_contents(&mut self, name: &str, content: &str) -> Result<(), SheetError> {
        let name = self.normalize_name(name)?;
        if content.is_empty() {
            return Ok(());
        }
        let contents = CellContents::from_input(content, &*self.is_valid, &*self.normalize)
            .map_err(SheetError::FormulaFormat)?;

        if let CellContents::Formula(formula) = &contents {
            let new_dependees: FxHashSet<String> =
                formula.variables().map(str::to_string).collect();
            let old_dependees: FxHashSet<String> =
                self.graph.dependees_of(&name).map(str::to_string).collect();

            self.graph.replace_dependees(&name, new_dependees);
            let result = self.cells_to_recalculate(&name);
            self.graph.replace_dependees(&name, old_dependees);

            result.map_err(SheetError::Circular)?;
        }
        Ok(())
    }

    /// Set the contents of `name` and recompute every transitive dependent.
    ///
    /// An empty `content` deletes the cell. Returns the recomputation order,
    /// starting with `name` itself. On any error the store and graph are
    /// left exactly as they were.
    pub fn set_contents(&mut self, name: &str, content: &str) -> Result<Vec<String>, SheetError> {
        let name = self.normalize_name(name)?;

        // Deleting an already-empty cell changes nothing; report the order
        // without dirtying the sheet.
        if content.is_empty() && !self.cells.contains_key(&name) {
            return self.cells_to_recalculate(&name).map_err(SheetError::Circular);
        }

        let new_contents = if content.is_empty() {
            None
        } else {
            Some(
                CellContents::from_input(content, &*self.is_valid, &*self.normalize)
                    .map_err(SheetError::FormulaFormat)?,
            )
        };

        let new_dependees: FxHashSet<String> = match &new_contents {
            Some(CellContents::Formula(formula)) => {
                formula.variables().map(str::to_string).collect()
            }
            _ => FxHashSet::default(),
        };

        // Tentatively rewire, and roll back if the new edges close a cycle.
        let old_dependees: FxHashSet<String> =
            self.graph.dependees_of(&name).map(str::to_string).collect();
        self.graph.replace_dependees(&name, new_dependees);

        let order = match self.cells_to_recalculate(&name) {
            Ok(order) => order,
            Err(cycle) => {
                self.graph.replace_dependees(&name, old_dependees);
                return Err(SheetError::Circular(cycle));
            }
        };

        match new_contents {
            None => {
                self.cells.remove(&name);
            }
            Some(contents) => {
                self.cells.insert(
                    name.clone(),
                    Cell {
                        contents,
                        value: CellValue::empty(),
                    },
                );
            }
        }

        self.recompute(&order);
        self.changed = true;
        Ok(order)
    }

    /// Topological order over `start` and its transitive dependents.
    ///
    /// Depth-first walk over dependent edges with on-stack marking; a back
    /// edge means the graph (as currently wired) has a cycle through `start`.
    /// This is the sole cycle detector.
    fn cells_to_recalculate(&self, start: &str) -> Result<Vec<String>, CycleError> {
        #[derive(PartialEq)]
        enum Mark {
            OnStack,
            Done,
        }

        struct Frame {
            name: String,
            neighbours: Vec<String>,
            next: usize,
        }

        let frame = |graph: &DepGraph, name: String| {
            let mut neighbours: Vec<String> =
                graph.dependents_of(&name).map(str::to_string).collect();
            neighbours.sort_unstable();
            Frame {
                name,
                neighbours,
                next: 0,
            }
        };

        let mut marks: FxHashMap<String, Mark> = FxHashMap::default();
        let mut postorder: Vec<String> = Vec::new();
        let mut stack: Vec<Frame> = Vec::new();

        marks.insert(start.to_string(), Mark::OnStack);
        stack.push(frame(&self.graph, start.to_string()));

        while !stack.is_empty() {
            let next = {
                let top = stack.last_mut().expect("stack is non-empty");
                if top.next < top.neighbours.len() {
                    let n = top.neighbours[top.next].clone();
                    top.next += 1;
                    Some(n)
                } else {
                    None
                }
            };

            match next {
                Some(neighbour) => match marks.get(neighbour.as_str()) {
                    Some(Mark::OnStack) => {
                        let from = stack
                            .iter()
                            .position(|f| f.name == neighbour)
                            .unwrap_or(0);
                        let cells: Vec<String> =
                            stack[from..].iter().map(|f| f.name.clone()).collect();
                        return Err(CycleError::new(cells));
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(neighbour.clone(), Mark::OnStack);
                        stack.push(frame(&self.graph, neighbour));
                    }
                },
                None => {
                    let finished = stack.pop().expect("stack is non-empty");
                    marks.insert(finished.name.clone(), Mark::Done);
                    postorder.push(finished.name);
                }
            }
        }

        postorder.reverse();
        Ok(postorder)
    }

    /// Recompute values along a topological order produced by
    /// `cells_to_recalculate`. Each formula sees the already-updated values
    /// of everything before it.
    fn recompute(&mut self, order: &[String]) {
        for name in order {
            let contents = match self.cells.get(name) {
                Some(cell) => cell.contents.clone(),
                None => continue,
            };
            let value = match contents {
                CellContents::Text(t) => CellValue::Text(t),
                CellContents::Number(n) => CellValue::Number(n),
                CellContents::Formula(formula) => {
                    let lookup = |var: &str| match self.cells.get(var).map(|c| &c.value) {
                        Some(CellValue::Number(n)) => Some(*n),
                        _ => None,
                    };
                    match formula.evaluate(&lookup) {
                        Ok(n) => CellValue::Number(n),
                        Err(e) => CellValue::Error(e),
                    }
                }
            };
            if let Some(cell) = self.cells.get_mut(name) {
                cell.value = value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet() -> Spreadsheet {
        Spreadsheet::new(Box::new(|_| true), Box::new(|s| s.to_uppercase()))
    }

    fn number(sheet: &Spreadsheet, name: &str) -> f64 {
        match sheet.value(name).unwrap() {
            CellValue::Number(n) => n,
            other => panic!("{} is not a number: {:?}", name, other),
        }
    }

    #[test]
    fn test_set_number() {
        let mut s = sheet();
        let order = s.set_contents("A1", "5").unwrap();
        assert_eq!(order, vec!["A1"]);
        assert_eq!(s.value("A1").unwrap(), CellValue::Number(5.0));
        assert_eq!(s.nonempty_names().collect::<Vec<_>>(), vec!["A1"]);
    }

    #[test]
    fn test_set_text() {
        let mut s = sheet();
        s.set_contents("A1", "hello").unwrap();
        assert_eq!(s.contents("A1").unwrap(), CellContents::Text("hello".into()));
        assert_eq!(s.value("A1").unwrap(), CellValue::Text("hello".into()));
    }

    #[test]
    fn test_empty_cell_reads_as_empty_text() {
        let s = sheet();
        assert_eq!(s.contents("Z9").unwrap(), CellContents::Text(String::new()));
        assert_eq!(s.value("Z9").unwrap(), CellValue::empty());
    }

    #[test]
    fn test_invalid_name_rejected() {
        let mut s = sheet();
        for bad in ["", "A", "1A", "A1B", "A-1"] {
            assert!(matches!(
                s.set_contents(bad, "1"),
                Err(SheetError::InvalidName(_))
            ));
        }
        assert!(matches!(s.value("A1B"), Err(SheetError::InvalidName(_))));
    }

    #[test]
    fn test_validator_rejects_names() {
        let mut s = Spreadsheet::new(
            Box::new(|name| name.len() <= 2),
            Box::new(|s| s.to_uppercase()),
        );
        assert!(s.set_contents("A1", "1").is_ok());
        assert!(matches!(
            s.set_contents("AA11", "1"),
            Err(SheetError::InvalidName(_))
        ));
    }

    #[test]
    fn test_normalization() {
        let mut s = sheet();
        s.set_contents("a1", "7").unwrap();
        assert_eq!(s.value("A1").unwrap(), CellValue::Number(7.0));
        assert_eq!(s.value("a1").unwrap(), CellValue::Number(7.0));
        assert_eq!(s.nonempty_names().collect::<Vec<_>>(), vec!["A1"]);
    }

    #[test]
    fn test_formula_chain_recompute() {
        let mut s = sheet();
        s.set_contents("A1", "5").unwrap();
        s.set_contents("B1", "=A1*2").unwrap();
        s.set_contents("C1", "=B1+A1").unwrap();
        assert_eq!(number(&s, "C1"), 15.0);

        let order = s.set_contents("A1", "10").unwrap();
        assert_eq!(order, vec!["A1", "B1", "C1"]);
        assert_eq!(number(&s, "A1"), 10.0);
        assert_eq!(number(&s, "B1"), 20.0);
        assert_eq!(number(&s, "C1"), 30.0);
    }

    #[test]
    fn test_diamond_recompute_order() {
        // B1 and C1 both read A1; D1 reads both. D1 must come last.
        let mut s = sheet();
        s.set_contents("A1", "1").unwrap();
        s.set_contents("B1", "=A1+1").unwrap();
        s.set_contents("C1", "=A1+2").unwrap();
        s.set_contents("D1", "=B1+C1").unwrap();

        let order = s.set_contents("A1", "10").unwrap();
        assert_eq!(order.first().map(String::as_str), Some("A1"));
        assert_eq!(order.last().map(String::as_str), Some("D1"));
        assert_eq!(order.len(), 4);
        assert_eq!(number(&s, "D1"), 23.0);
    }

    #[test]
    fn test_formula_on_missing_cell_errors() {
        let mut s = sheet();
        s.set_contents("B1", "=A1+1").unwrap();
        assert!(matches!(s.value("B1").unwrap(), CellValue::Error(_)));

        // Filling in the dependee repairs the dependent.
        s.set_contents("A1", "4").unwrap();
        assert_eq!(number(&s, "B1"), 5.0);
    }

    #[test]
    fn test_formula_on_text_cell_errors() {
        let mut s = sheet();
        s.set_contents("A1", "words").unwrap();
        s.set_contents("B1", "=A1*2").unwrap();
        assert!(matches!(s.value("B1").unwrap(), CellValue::Error(_)));
    }

    #[test]
    fn test_division_by_zero_value() {
        let mut s = sheet();
        s.set_contents("A1", "0").unwrap();
        s.set_contents("B1", "=1/A1").unwrap();
        match s.value("B1").unwrap() {
            CellValue::Error(e) => assert_eq!(e.reason, "division by zero"),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_circular_rejection_leaves_state_untouched() {
        let mut s = sheet();
        s.set_contents("A1", "=B1").unwrap();
        let err = s.set_contents("B1", "=A1");
        assert!(matches!(err, Err(SheetError::Circular(_))));

        // A1 keeps its formula; B1 stays empty.
        assert_eq!(s.contents("A1").unwrap().to_string(), "=B1");
        assert_eq!(s.contents("B1").unwrap(), CellContents::Text(String::new()));
        assert_eq!(s.nonempty_names().collect::<Vec<_>>(), vec!["A1"]);

        // And the graph still accepts a non-circular B1.
        s.set_contents("B1", "3").unwrap();
        assert_eq!(number(&s, "A1"), 3.0);
    }

    #[test]
    fn test_self_reference_rejected() {
        let mut s = sheet();
        assert!(matches!(
            s.set_contents("A1", "=A1+1"),
            Err(SheetError::Circular(_))
        ));
        assert_eq!(s.nonempty_names().count(), 0);
    }

    #[test]
    fn test_indirect_cycle_rejected() {
        let mut s = sheet();
        s.set_contents("B1", "=A1").unwrap();
        s.set_contents("C1", "=B1").unwrap();
        let err = s.set_contents("A1", "=C1").unwrap_err();
        match err {
            SheetError::Circular(cycle) => {
                assert!(cycle.message.contains("circular"), "{}", cycle.message)
            }
            other => panic!("expected cycle, got {:?}", other),
        }
        // A1 is unchanged (still empty).
        assert_eq!(s.value("A1").unwrap(), CellValue::empty());
    }

    #[test]
    fn test_replacing_formula_drops_old_edges() {
        let mut s = sheet();
        s.set_contents("B1", "=A1").unwrap();
        s.set_contents("B1", "=C1").unwrap();

        // A1 no longer feeds B1, so changing it recomputes nothing else.
        let order = s.set_contents("A1", "9").unwrap();
        assert_eq!(order, vec!["A1"]);

        // B1 = A1 is legal again; only the C1 edge remains otherwise.
        s.set_contents("A1", "=B1").unwrap();
        assert!(matches!(s.value("A1").unwrap(), CellValue::Error(_)));
    }

    #[test]
    fn test_delete_cell() {
        let mut s = sheet();
        s.set_contents("A1", "5").unwrap();
        s.set_contents("B1", "=A1").unwrap();

        let order = s.set_contents("A1", "").unwrap();
        assert_eq!(order, vec!["A1", "B1"]);
        assert_eq!(s.value("A1").unwrap(), CellValue::empty());
        assert!(matches!(s.value("B1").unwrap(), CellValue::Error(_)));
        assert_eq!(s.nonempty_names().collect::<Vec<_>>(), vec!["B1"]);
    }

    #[test]
    fn test_delete_empty_cell_is_noop() {
        let mut s = sheet();
        let order = s.set_contents("A1", "").unwrap();
        assert_eq!(order, vec!["A1"]);
        assert!(!s.is_changed());
        assert_eq!(s.nonempty_names().count(), 0);
    }

    #[test]
    fn test_atomic_failure_preserves_values() {
        let mut s = sheet();
        s.set_contents("A1", "1").unwrap();
        s.set_contents("B1", "=A1+1").unwrap();

        let before_a = s.value("A1").unwrap();
        let before_b = s.value("B1").unwrap();

        assert!(s.set_contents("A1", "=B1").is_err()); // cycle
        assert!(s.set_contents("A1", "=1++2").is_err()); // format

        assert_eq!(s.value("A1").unwrap(), before_a);
        assert_eq!(s.value("B1").unwrap(), before_b);
        assert_eq!(s.contents("A1").unwrap(), CellContents::Number(1.0));
    }

    #[test]
    fn test_changed_flag_lifecycle() {
        let mut s = sheet();
        assert!(!s.is_changed());
        s.set_contents("A1", "1").unwrap();
        assert!(s.is_changed());
        s.mark_saved();
        assert!(!s.is_changed());

        // A failed update does not dirty the sheet.
        assert!(s.set_contents("A1", "=A1").is_err());
        assert!(!s.is_changed());
    }

    #[test]
    fn test_check_contents_does_not_mutate() {
        let mut s = sheet();
        s.set_contents("A1", "=B1").unwrap();

        assert!(s.check_contents("B1", "7").is_ok());
        assert!(matches!(
            s.check_contents("B1", "=A1"),
            Err(SheetError::Circular(_))
        ));
        assert!(matches!(
            s.check_contents("B1", "=(("),
            Err(SheetError::FormulaFormat(_))
        ));
        assert!(matches!(
            s.check_contents("B-1", "7"),
            Err(SheetError::InvalidName(_))
        ));

        // Nothing was stored and the graph still works.
        assert_eq!(s.nonempty_names().collect::<Vec<_>>(), vec!["A1"]);
        s.set_contents("B1", "2").unwrap();
        assert_eq!(number(&s, "A1"), 2.0);
    }

    #[test]
    fn test_recompute_order_covers_exactly_changed_values() {
        let mut s = sheet();
        s.set_contents("A1", "1").unwrap();
        s.set_contents("B1", "=A1*2").unwrap();
        s.set_contents("C1", "=B1*2").unwrap();
        s.set_contents("D1", "42").unwrap(); // unrelated

        let order = s.set_contents("A1", "3").unwrap();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["A1", "B1", "C1"]);
        assert_eq!(number(&s, "D1"), 42.0);
    }
}
