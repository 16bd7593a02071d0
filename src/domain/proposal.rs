use crate::api::protocol::Proposal;

/// Computes the room counts offered for one request against the FREE
/// counts read from the inventory.
///
/// Classrooms and labs are clamped to what is actually free; a lab
/// shortfall is covered by spare classrooms serving as mobile labs, up to
/// whatever classrooms remain after the classroom share is taken.
///
/// # Returns
/// Returns the Proposal triple (salones, laboratorios, aulas móviles).
pub fn compute_proposal(requested_class: u32, requested_lab: u32, cls_free: u32, lab_free: u32) -> Proposal {
    let salones_propuestos = requested_class.min(cls_free);
    let laboratorios_propuestos = requested_lab.min(lab_free);
    let deficit = requested_lab - laboratorios_propuestos;
    let aulas_moviles = deficit.min(cls_free.saturating_sub(salones_propuestos));

    Proposal { salones_propuestos, laboratorios_propuestos, aulas_moviles }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fully_satisfiable_request_passes_through() {
        let p = compute_proposal(3, 1, 380, 60);
        assert_eq!(p, Proposal { salones_propuestos: 3, laboratorios_propuestos: 1, aulas_moviles: 0 });
    }

    #[test]
    fn lab_shortfall_is_covered_by_mobile_classrooms() {
        let p = compute_proposal(2, 2, 380, 0);
        assert_eq!(p, Proposal { salones_propuestos: 2, laboratorios_propuestos: 0, aulas_moviles: 2 });
        assert_eq!(p.total_rooms(), 4);
    }

    #[test]
    fn partial_lab_inventory_adapts_only_the_deficit() {
        let p = compute_proposal(1, 3, 10, 2);
        assert_eq!(p, Proposal { salones_propuestos: 1, laboratorios_propuestos: 2, aulas_moviles: 1 });
    }

    #[test]
    fn classroom_request_is_clamped_to_free_count() {
        let p = compute_proposal(5, 0, 2, 60);
        assert_eq!(p.salones_propuestos, 2);
        assert_eq!(p.aulas_moviles, 0);
    }

    #[test]
    fn mobile_labs_never_exceed_spare_classrooms() {
        // 4 classrooms free, 3 go to the classroom share, 1 left to adapt.
        let p = compute_proposal(3, 2, 4, 0);
        assert_eq!(p, Proposal { salones_propuestos: 3, laboratorios_propuestos: 0, aulas_moviles: 1 });
    }

    #[test]
    fn exhausted_inventory_yields_an_empty_proposal() {
        let p = compute_proposal(1, 0, 0, 0);
        assert!(p.is_empty());
    }
}
